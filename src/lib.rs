//! peerwire - A BitTorrent peer-wire engine
//!
//! This library runs the peer side of a BitTorrent swarm: it negotiates
//! connections (with optional message stream encryption), runs one session
//! per peer and schedules piece and metadata downloads from a single
//! coordinator.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - Info dictionary and info hash, BEP-9 verification
//! - [`peer`] - BEP-3/6/10 Peer wire protocol, MSE handshake, sessions, choking
//! - [`peer_manager`] - Bounded dialing and accepting, peer id deduplication
//! - [`storage`] - Block storage collaborator and an in-memory implementation
//! - [`torrent`] - The coordinator: piece and metadata downloads, serving
//! - [`config`] - Engine tunables
//! - [`constants`] - Protocol constants

pub mod bencode;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod peer_manager;
pub mod storage;
pub mod torrent;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{Config, ConfigError};
pub use metainfo::{Info, InfoHash, MetainfoError};
pub use peer::{
    Bitfield, ExtensionBitmap, ExtensionHandshake, Handshake, HandshakeError,
    HandshakeNegotiator, Message, PeerError, PeerId, PeerSession,
};
pub use peer_manager::{PeerAddressSource, PeerList, PeerManager};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use torrent::{start, Torrent, TorrentError, TorrentEvent, TorrentHandle};
