use thiserror::Error;

/// Errors that can occur while decoding bencode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// An integer was empty, had leading zeros, was `-0` or overflowed.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// A byte string length prefix was malformed or too large.
    #[error("invalid string length")]
    InvalidStringLength,

    /// A byte that cannot start or continue a value.
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    /// A dictionary key was not a byte string.
    #[error("dictionary key is not a byte string")]
    NonStringKey,

    /// [`decode`](super::decode) found bytes after the value.
    #[error("trailing data after value")]
    TrailingData,

    /// Lists and dictionaries nested beyond the decoder limit.
    #[error("nesting too deep")]
    NestingTooDeep,
}
