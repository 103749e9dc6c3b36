use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors that can occur when parsing or verifying an info dictionary.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The info dictionary is not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// A required field is missing.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field has an invalid value or type.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The info hash has an invalid length (must be 20 bytes).
    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    /// SHA1 of the received bytes does not match the expected info hash.
    #[error("info hash mismatch")]
    HashMismatch,
}
