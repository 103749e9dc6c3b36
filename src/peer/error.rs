use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors on an established peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Extension protocol error.
    #[error("extension error: {0}")]
    Extension(String),

    /// Error decoding bencode in extension messages.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
}

/// Errors while negotiating a new connection. The transport is always
/// dropped when one of these is returned.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// The peer sent bytes that are not a valid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Incoming handshake for a torrent we don't serve.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// Plaintext was offered but encryption is required.
    #[error("encryption required")]
    EncryptionRequired,

    /// The obfuscated handshake could not be completed.
    #[error("encryption handshake failed: {0}")]
    EncryptionFailed(String),

    /// The peer offered no cipher we accept.
    #[error("no common cipher")]
    NoCommonCipher,

    #[error(transparent)]
    Peer(#[from] PeerError),
}
