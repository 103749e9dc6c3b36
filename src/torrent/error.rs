use thiserror::Error;

use crate::config::ConfigError;
use crate::metainfo::MetainfoError;
use crate::peer::PeerError;
use crate::storage::StorageError;

/// Errors raised while running a torrent.
///
/// Only [`is_fatal`](TorrentError::is_fatal) errors stop the torrent; the
/// rest end or demote a single peer.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The peer broke the protocol; its session is closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A block or metadata piece did not arrive in time.
    #[error("transfer timed out")]
    TransferTimeout,

    /// The peer id is already connected to this torrent.
    #[error("peer id already connected")]
    DuplicateIdentity,

    /// The session ended.
    #[error("disconnected: {0}")]
    Disconnect(#[source] PeerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    /// No peer delivered valid metadata before the deadline.
    #[error("metadata unavailable")]
    MetadataUnavailable,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TorrentError {
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation(msg.into())
    }

    /// Whether the error concerns the whole torrent rather than one peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::Storage(_)
                | TorrentError::Metainfo(_)
                | TorrentError::MetadataUnavailable
                | TorrentError::Config(_)
        )
    }
}
