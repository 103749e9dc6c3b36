//! Download and upload coordination for one torrent.
//!
//! A [`Torrent`] is the only place where piece and peer state changes.
//! Sessions report what they read on a shared inbox, the peer manager hands
//! over new connections, and a timer drives timeouts and the choker; the
//! coordinator handles these one at a time and answers through each
//! session's outbound queue.
//!
//! Blocks are fetched by [`PieceDownloader`]s, one piece per peer (more in
//! endgame). While the info dictionary is unknown, [`InfoDownloader`]s
//! fetch it over ut_metadata and messages that need it are held back on the
//! session and replayed afterwards.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::peer_manager::PeerList;
//! use peerwire::storage::MemoryStorage;
//! use peerwire::torrent::{self, TorrentEvent};
//! use peerwire::{Config, InfoHash};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let info_hash = InfoHash::from_hex("c12fe1c06bba254a9dc9f519b335aa7c1367a88a")?;
//! let peers = Arc::new(PeerList::new());
//! peers.push(["192.0.2.10:6881".parse()?]);
//!
//! let handle = torrent::start(
//!     Config::default(),
//!     info_hash,
//!     None,
//!     MemoryStorage::new(),
//!     peers,
//!     None,
//! )?;
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     if let TorrentEvent::Completed = event {
//!         break;
//!     }
//! }
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod event;
mod info_downloader;
mod piece;
mod piece_downloader;

pub use coordinator::Torrent;
pub use error::TorrentError;
pub use event::TorrentEvent;
pub use info_downloader::InfoDownloader;
pub use piece::{compute_block_count, compute_block_length, Block, BlockState, Piece};
pub use piece_downloader::{PieceDownloader, Stall};

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::constants::{EVENT_CHANNEL_CAPACITY, NEW_PEERS_CAPACITY};
use crate::metainfo::{Info, InfoHash};
use crate::peer::{HandshakeNegotiator, PeerId};
use crate::peer_manager::{PeerAddressSource, PeerManager};
use crate::storage::Storage;

/// A running torrent.
pub struct TorrentHandle {
    peer_id: PeerId,
    events: broadcast::Sender<TorrentEvent>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TorrentHandle {
    /// The peer ID this torrent handshakes with.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribes to torrent events. Only events sent after this call are
    /// received, and a slow receiver may see `Lagged`.
    pub fn events(&self) -> broadcast::Receiver<TorrentEvent> {
        self.events.subscribe()
    }

    /// Whether the torrent has stopped, on request or after a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the torrent and waits for every connection to close.
    pub async fn stop(self) {
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Starts downloading (or seeding) `info_hash`.
///
/// Without `info` the metadata is fetched from peers first. Addresses to
/// dial come from `source`; with a `listener`, incoming connections are
/// accepted too. Must be called within a Tokio runtime.
pub fn start<St, S>(
    config: Config,
    info_hash: InfoHash,
    info: Option<Info>,
    storage: St,
    source: Arc<S>,
    listener: Option<TcpListener>,
) -> Result<TorrentHandle, TorrentError>
where
    St: Storage,
    S: PeerAddressSource,
{
    config.validate()?;
    let peer_id = PeerId::with_prefix(&config.peer_id_prefix);
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let torrent = Torrent::new(
        config.clone(),
        info_hash,
        info,
        storage,
        events.clone(),
        Instant::now(),
    )?;

    let negotiator = HandshakeNegotiator::new(&config, peer_id);
    let manager = PeerManager::new(&config, negotiator, info_hash, source, listener);
    let (new_peers_tx, new_peers_rx) = mpsc::channel(NEW_PEERS_CAPACITY);
    let stop = CancellationToken::new();

    info!("torrent {}: starting as {}", info_hash, peer_id);
    let tasks = vec![
        tokio::spawn(manager.run(new_peers_tx, stop.clone())),
        tokio::spawn(torrent.run(new_peers_rx, stop.clone())),
    ];

    Ok(TorrentHandle {
        peer_id,
        events,
        stop,
        tasks,
    })
}

#[cfg(test)]
mod tests;
