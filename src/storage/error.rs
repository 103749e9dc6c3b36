use thiserror::Error;

/// Errors reported by a [`Storage`](super::Storage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `prepare` has not been called yet.
    #[error("storage has not been prepared for a torrent")]
    NotPrepared,

    /// The piece is past the end of the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// The block does not lie inside its piece.
    #[error("invalid block: piece {piece}, offset {begin}, length {length}")]
    InvalidBlock { piece: u32, begin: u32, length: u32 },

    /// Seeded data does not match the torrent length.
    #[error("data is {actual} bytes, torrent needs {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}
