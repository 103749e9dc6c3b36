use std::sync::Arc;

use super::error::TorrentError;

/// Progress notifications published by a running torrent.
#[derive(Debug, Clone)]
pub enum TorrentEvent {
    /// The info dictionary was received and verified.
    MetadataReady,
    /// A piece was written and passed hash verification.
    PieceCompleted(u32),
    /// Every piece is verified. Sent once.
    Completed,
    /// The torrent stopped because of a torrent-level failure.
    Error(Arc<TorrentError>),
}
