//! Bencode support for the extension protocol ([BEP-3]).
//!
//! Only the pieces the wire needs are here: the value model, a decoder that
//! can stop after the first value (BEP-9 data messages carry raw bytes after
//! the dictionary) and a canonical encoder.
//!
//! ```
//! use peerwire::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:mi3ee").unwrap();
//! assert_eq!(value.get(b"m").and_then(Value::as_integer), Some(3));
//! assert_eq!(encode(&value), b"d1:mi3ee");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
