mod handler;
mod scheduler;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::TorrentError;
use super::event::TorrentEvent;
use super::info_downloader::InfoDownloader;
use super::piece::Piece;
use super::piece_downloader::PieceDownloader;
use crate::config::Config;
use crate::constants::{
    ADVERTISED_REQUEST_QUEUE, ALLOWED_FAST_SET_SIZE, EXTENSION_HANDSHAKE_ID, PEER_INBOX_CAPACITY,
};
use crate::metainfo::{Info, InfoHash};
use crate::peer::{
    allowed_fast_set, Bitfield, ChokingState, Choker, ExtensionHandshake, Message, PeerEvent,
    PeerHandle, PeerKey,
};
use crate::peer_manager::{NewPeer, Registration};
use crate::storage::Storage;

/// What the coordinator knows about one connected peer.
pub(crate) struct PeerState {
    pub(crate) handle: PeerHandle,
    _registration: Registration,
    pub(crate) choking: ChokingState,
    /// The peer's BEP-10 handshake, once received.
    pub(crate) extension: Option<ExtensionHandshake>,
    /// Messages received before the metadata, replayed once it arrives.
    pub(crate) pending: VecDeque<Message>,
    /// Pieces we let this peer download while choked.
    pub(crate) granted_fast: HashSet<u32>,
    /// Pieces this peer refused to send us since it last unchoked us.
    pub(crate) rejected_pieces: HashSet<u32>,
    /// Requests dropped when a fast peer choked us. The peer still owes a
    /// Reject for each of them.
    pub(crate) abandoned: HashSet<(u32, u32, u32)>,
    /// Whether a metadata download from this peer was ever started.
    pub(crate) metadata_tried: bool,
    pub(crate) downloaded: u64,
    pub(crate) uploaded: u64,
}

impl PeerState {
    fn new(handle: PeerHandle, registration: Registration) -> Self {
        Self {
            handle,
            _registration: registration,
            choking: ChokingState::default(),
            extension: None,
            pending: VecDeque::new(),
            granted_fast: HashSet::new(),
            rejected_pieces: HashSet::new(),
            abandoned: HashSet::new(),
            metadata_tried: false,
            downloaded: 0,
            uploaded: 0,
        }
    }

    pub(crate) fn send(&self, message: Message) {
        self.handle.send(message);
    }

    /// Our request queue towards this peer, bounded by its `reqq`.
    fn queue_len(&self, configured: usize) -> usize {
        match self.extension.as_ref().and_then(|hs| hs.reqq) {
            Some(reqq) if reqq > 0 => configured.min(reqq as usize),
            _ => configured,
        }
    }
}

/// The single owner of a torrent's piece and peer state.
///
/// Every peer message, new connection and timer tick is handled here, one
/// at a time. Sessions and downloaders never touch the piece table.
pub struct Torrent<St> {
    config: Config,
    info_hash: InfoHash,
    info: Option<Info>,
    storage: St,
    /// Our pieces; `None` until the metadata is known.
    bitfield: Option<Bitfield>,
    pieces: Vec<Piece>,
    peers: BTreeMap<PeerKey, PeerState>,
    downloads: BTreeMap<PeerKey, PieceDownloader>,
    info_downloads: BTreeMap<PeerKey, InfoDownloader>,
    choker: Choker,
    events: broadcast::Sender<TorrentEvent>,
    started: Instant,
    completed: bool,
}

impl<St: Storage> Torrent<St> {
    /// Creates the coordinator. Without `info` the metadata is fetched
    /// from peers first.
    pub fn new(
        config: Config,
        info_hash: InfoHash,
        info: Option<Info>,
        storage: St,
        events: broadcast::Sender<TorrentEvent>,
        now: Instant,
    ) -> Result<Self, TorrentError> {
        let choker = Choker::new(&config, now);
        let mut torrent = Self {
            config,
            info_hash,
            info: None,
            storage,
            bitfield: None,
            pieces: Vec::new(),
            peers: BTreeMap::new(),
            downloads: BTreeMap::new(),
            info_downloads: BTreeMap::new(),
            choker,
            events,
            started: now,
            completed: false,
        };
        if let Some(info) = info {
            if info.info_hash() != info_hash {
                return Err(crate::metainfo::MetainfoError::HashMismatch.into());
            }
            torrent.load_info(info)?;
            if torrent.is_complete() {
                torrent.completed = true;
                torrent.emit(TorrentEvent::Completed);
            }
        }
        Ok(torrent)
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// The info dictionary, once known or fetched from peers.
    pub fn info(&self) -> Option<&Info> {
        self.info.as_ref()
    }

    /// Verified pieces. `None` until the info dictionary is known.
    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.bitfield.as_ref()
    }

    /// Whether every piece has been verified.
    pub fn is_complete(&self) -> bool {
        self.bitfield.as_ref().is_some_and(Bitfield::is_complete)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn storage(&self) -> &St {
        &self.storage
    }

    fn piece_count(&self) -> Option<u32> {
        self.info.as_ref().map(Info::piece_count)
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.events.send(event);
    }

    /// Builds the piece table for `info` and asks storage what it has.
    fn load_info(&mut self, info: Info) -> Result<(), TorrentError> {
        let bitfield = self.storage.prepare(&info)?;
        self.pieces = (0..info.piece_count())
            .map(|i| {
                let mut piece = Piece::new(i, info.piece_size(i));
                if bitfield.has(i as usize) {
                    piece.mark_complete();
                }
                piece
            })
            .collect();
        info!(
            "torrent {}: {} pieces, {} verified",
            self.info_hash,
            info.piece_count(),
            bitfield.count()
        );
        self.bitfield = Some(bitfield);
        self.info = Some(info);
        Ok(())
    }

    /// Starts tracking a session and sends our opening messages: what we
    /// have, the extension handshake and the pieces we allow while choked.
    pub fn add_peer(&mut self, handle: PeerHandle, registration: Registration, now: Instant) {
        let key = handle.key();
        if self.peers.values().any(|p| p.handle.peer_id() == handle.peer_id()) {
            debug!(
                "peer {} {}: {}",
                key,
                handle.addr(),
                TorrentError::DuplicateIdentity
            );
            handle.close();
            return;
        }

        let peer = PeerState::new(handle, registration);
        let fast = peer.handle.supports_fast();
        match &self.bitfield {
            Some(bitfield) if fast && bitfield.is_complete() => peer.send(Message::HaveAll),
            Some(bitfield) if fast && bitfield.is_empty() => peer.send(Message::HaveNone),
            Some(bitfield) if !bitfield.is_empty() => {
                peer.send(Message::Bitfield(bitfield.to_bytes()))
            }
            Some(_) => {}
            None if fast => peer.send(Message::HaveNone),
            None => {}
        }

        if peer.handle.extensions().supports_extension_protocol() {
            let mut hs = ExtensionHandshake::local(
                &self.config.extension_handshake_client_version,
                ADVERTISED_REQUEST_QUEUE,
                self.info.as_ref().map(Info::metadata_size),
            );
            hs.yourip = Some(ip_bytes(peer.handle.addr().ip()));
            peer.send(Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: hs.encode(),
            });
        }

        self.peers.insert(key, peer);
        self.grant_allowed_fast(key);
        debug!("torrent {}: {} peers", self.info_hash, self.peers.len());
        self.start_piece_downloaders(now);
    }

    fn grant_allowed_fast(&mut self, key: PeerKey) {
        let Some(piece_count) = self.piece_count() else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if !peer.handle.supports_fast() {
            return;
        }
        let set = allowed_fast_set(
            &self.info_hash,
            peer.handle.addr().ip(),
            piece_count,
            ALLOWED_FAST_SET_SIZE,
        );
        for piece in set {
            if peer.granted_fast.insert(piece) {
                peer.handle.send(Message::AllowedFast { piece });
            }
        }
    }

    /// Closes a misbehaving peer and forgets it at once; its pending
    /// `Disconnected` is ignored later.
    fn close_peer(&mut self, key: PeerKey, reason: &TorrentError) {
        if let Some(peer) = self.peers.get(&key) {
            warn!("peer {} {}: {}", key, peer.handle.addr(), reason);
            peer.handle.close();
        }
        self.remove_peer(key);
    }

    /// Drops every trace of `key`: piece membership, in-flight blocks and
    /// downloaders. Released blocks become available to other peers.
    fn remove_peer(&mut self, key: PeerKey) {
        if self.peers.remove(&key).is_none() {
            return;
        }
        if let Some(mut downloader) = self.downloads.remove(&key) {
            let piece = &mut self.pieces[downloader.piece() as usize];
            downloader.release_all(piece);
        }
        self.info_downloads.remove(&key);
        for piece in &mut self.pieces {
            piece.having_peers.remove(&key);
            piece.allowed_fast_peers.remove(&key);
        }
        self.choker.remove_peer(key);
    }

    /// Applies one event from a session. An error is fatal to the torrent.
    pub fn handle_event(&mut self, event: PeerEvent, now: Instant) -> Result<(), TorrentError> {
        match event {
            PeerEvent::Message { key, message } => self.handle_message(key, message, now),
            PeerEvent::Disconnected { key, error } => {
                self.handle_disconnect(key, error, now);
                Ok(())
            }
        }
    }

    /// Forgets a peer: its requests go back to the pool and its downloads
    /// are dropped. Unknown keys are ignored.
    pub fn handle_disconnect(
        &mut self,
        key: PeerKey,
        error: Option<crate::peer::PeerError>,
        now: Instant,
    ) {
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        match error {
            Some(e) => debug!("peer {} {}: {}", key, peer.handle.addr(), TorrentError::Disconnect(e)),
            None => debug!("peer {} {}: disconnected", key, peer.handle.addr()),
        }
        self.remove_peer(key);
        self.start_piece_downloaders(now);
        self.start_info_downloaders(now);
    }

    /// Periodic work: download timeouts, the choker and the metadata
    /// deadline.
    pub fn on_tick(&mut self, now: Instant) -> Result<(), TorrentError> {
        if self.info.is_none() {
            if let Some(limit) = self.config.metadata_timeout {
                if now.saturating_duration_since(self.started) >= limit {
                    return Err(TorrentError::MetadataUnavailable);
                }
            }
        }
        self.check_stalls(now);
        self.run_choker(now);
        self.start_piece_downloaders(now);
        self.start_info_downloaders(now);
        Ok(())
    }

    /// Serves the torrent until `stop` fires or a torrent-level error
    /// occurs. Sessions arriving on `new_peers` are spawned here.
    pub async fn run(mut self, mut new_peers: mpsc::Receiver<NewPeer>, stop: CancellationToken) {
        let (inbox_tx, mut inbox) = mpsc::channel(PEER_INBOX_CAPACITY);
        let mut sessions = JoinSet::new();
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let step = tokio::select! {
                _ = stop.cancelled() => None,
                Some(event) = inbox.recv() => Some(self.handle_event(event, Instant::now())),
                Some(new_peer) = new_peers.recv() => {
                    let NewPeer { session, registration } = new_peer;
                    let handle = session.handle();
                    sessions.spawn(session.run(inbox_tx.clone()));
                    self.add_peer(handle, registration, Instant::now());
                    Some(Ok(()))
                }
                _ = ticker.tick() => {
                    while sessions.try_join_next().is_some() {}
                    Some(self.on_tick(Instant::now()))
                }
            };
            match step {
                None => break Ok(()),
                Some(Err(e)) => break Err(e),
                Some(Ok(())) => {}
            }
        };

        if let Err(e) = result {
            error!("torrent {}: stopping: {}", self.info_hash, e);
            self.emit(TorrentEvent::Error(Arc::new(e)));
            stop.cancel();
        }

        for peer in self.peers.values() {
            peer.handle.close();
        }
        drop(inbox);
        drop(inbox_tx);
        while sessions.join_next().await.is_some() {}
        debug!("torrent {}: stopped", self.info_hash);
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}
