//! Connection intake for one swarm.
//!
//! The [`PeerManager`] runs two bounded intake paths: an [`Acceptor`] for
//! inbound connections and a [`Dialer`] for addresses from a
//! [`PeerAddressSource`]. Every negotiated connection must register its peer
//! id in the [`PeerIdRegistry`] before it is wrapped in a
//! [`PeerSession`](crate::peer::PeerSession) and handed to the torrent as a
//! [`NewPeer`]; a duplicate id is disconnected on the spot.

mod acceptor;
mod address;
mod dialer;
mod registry;

pub use acceptor::Acceptor;
pub use address::{PeerAddressSource, PeerList};
pub use dialer::Dialer;
pub use registry::{PeerIdRegistry, Registration};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::metainfo::InfoHash;
use crate::peer::{HandshakeNegotiator, Negotiated, PeerSession, TorrentLookup};

/// A session ready to be started by the torrent. The registration is held
/// for as long as the session runs.
pub struct NewPeer {
    pub session: PeerSession,
    pub registration: Registration,
}

/// What both intake paths share.
#[derive(Clone)]
pub struct Intake {
    negotiator: Arc<HandshakeNegotiator>,
    registry: Arc<PeerIdRegistry>,
    new_peers: mpsc::Sender<NewPeer>,
    stop: CancellationToken,
    read_buffer_size: usize,
}

impl Intake {
    pub fn new(
        negotiator: Arc<HandshakeNegotiator>,
        registry: Arc<PeerIdRegistry>,
        new_peers: mpsc::Sender<NewPeer>,
        stop: CancellationToken,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            negotiator,
            registry,
            new_peers,
            stop,
            read_buffer_size,
        }
    }

    /// Registers the peer id and passes the session on, unless the stop
    /// signal fires first. Dropping `negotiated` closes the connection.
    async fn deliver(&self, negotiated: Negotiated, addr: SocketAddr, arrow: &str) {
        if negotiated.peer_id == self.negotiator.peer_id() {
            debug!("peer {} {}: connected to ourselves, closing", arrow, addr);
            return;
        }
        let Some(registration) = self.registry.try_register(negotiated.peer_id) else {
            debug!(
                "peer {} {}: peer id {} already connected, closing",
                arrow, addr, negotiated.peer_id
            );
            return;
        };

        info!(
            "peer {} {}: connected (cipher={} extensions={:?} client={:?})",
            arrow, addr, negotiated.cipher, negotiated.remote_extensions, negotiated.peer_id
        );
        let session = PeerSession::new(negotiated, addr, &self.stop, self.read_buffer_size);
        let new_peer = NewPeer {
            session,
            registration,
        };
        tokio::select! {
            sent = self.new_peers.send(new_peer) => {
                if sent.is_err() {
                    debug!("peer {} {}: torrent is gone, closing", arrow, addr);
                }
            }
            _ = self.stop.cancelled() => {}
        }
    }
}

/// Runs the acceptor and dialer of one swarm until stopped.
pub struct PeerManager<S> {
    negotiator: Arc<HandshakeNegotiator>,
    registry: Arc<PeerIdRegistry>,
    info_hash: InfoHash,
    source: Arc<S>,
    listener: Option<TcpListener>,
    max_peer_dial: usize,
    max_peer_accept: usize,
    read_buffer_size: usize,
}

impl<S: PeerAddressSource> PeerManager<S> {
    /// Without a listener only outbound connections are made.
    pub fn new(
        config: &Config,
        negotiator: HandshakeNegotiator,
        info_hash: InfoHash,
        source: Arc<S>,
        listener: Option<TcpListener>,
    ) -> Self {
        Self {
            negotiator: Arc::new(negotiator),
            registry: PeerIdRegistry::new(),
            info_hash,
            source,
            listener,
            max_peer_dial: config.max_peer_dial,
            max_peer_accept: config.max_peer_accept,
            read_buffer_size: config.peer_read_buffer_size,
        }
    }

    /// Peer ids of every live connection, shared with the intake tasks.
    pub fn registry(&self) -> Arc<PeerIdRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs until `stop` fires, then waits for in-flight negotiations.
    pub async fn run(self, new_peers: mpsc::Sender<NewPeer>, stop: CancellationToken) {
        let intake = Intake::new(
            self.negotiator,
            self.registry,
            new_peers,
            stop,
            self.read_buffer_size,
        );
        let dialer = Dialer::new(
            intake.clone(),
            self.source,
            self.info_hash,
            self.max_peer_dial,
        );

        match self.listener {
            Some(listener) => {
                let lookup: Arc<dyn TorrentLookup> = Arc::new(self.info_hash);
                let acceptor = Acceptor::new(intake, listener, lookup, self.max_peer_accept);
                tokio::join!(dialer.run(), acceptor.run());
            }
            None => dialer.run().await,
        }
    }
}

#[cfg(test)]
mod tests;
