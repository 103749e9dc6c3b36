//! Metadata exchange extension (ut_metadata, BEP-9).
//!
//! Messages are a bencoded dictionary; data messages carry the raw metadata
//! piece right after the dictionary.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode, Value};
use crate::constants::METADATA_PIECE_SIZE;

/// The `msg_type` of a ut_metadata message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    /// Asks for one metadata piece.
    Request = 0,
    /// Carries one metadata piece.
    Data = 1,
    /// The peer will not send the requested piece.
    Reject = 2,
}

impl MetadataMessageType {
    /// Maps a wire `msg_type` to a message type; unknown values give `None`.
    pub fn from_byte(b: i64) -> Option<Self> {
        match b {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A metadata exchange message (ut_metadata, BEP-9).
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use peerwire::peer::{MetadataMessage, MetadataMessageType};
///
/// let msg = MetadataMessage::data(0, 3, Bytes::from_static(b"abc"));
/// let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
///
/// assert_eq!(decoded.msg_type, MetadataMessageType::Data);
/// assert_eq!(decoded.total_size, Some(3));
/// assert_eq!(decoded.data.as_deref(), Some(&b"abc"[..]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    /// Request, data or reject.
    pub msg_type: MetadataMessageType,
    /// Index of the 16 KiB metadata piece.
    pub piece: u32,
    /// Total metadata size; present on data messages.
    pub total_size: Option<u32>,
    /// Piece payload; present on data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    /// Creates a request for metadata piece `piece`.
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    /// Creates a data message carrying `data` as metadata piece `piece`.
    pub fn data(piece: u32, total_size: u32, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    /// Creates a reject for metadata piece `piece`.
    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    /// Encodes the message payload: a bencoded dictionary, followed by the
    /// raw piece on data messages.
    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Integer(self.msg_type as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(self.piece as i64),
        );
        if let Some(total_size) = self.total_size {
            dict.insert(
                Bytes::from_static(b"total_size"),
                Value::Integer(total_size as i64),
            );
        }

        let header = encode(&Value::Dict(dict));
        let data = self.data.as_deref().unwrap_or_default();
        let mut buf = BytesMut::with_capacity(header.len() + data.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(data);
        buf.freeze()
    }

    /// Decodes a message payload. Everything after the dictionary of a data
    /// message is taken as the piece.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Extension`] if a required key is missing or out
    /// of range, and a bencode error if the dictionary is malformed.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (value, dict_len) = decode_prefix(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let int = |key: &'static str| {
            dict.get(key.as_bytes())
                .and_then(Value::as_integer)
                .ok_or_else(|| PeerError::Extension(format!("missing {}", key)))
        };

        let msg_type = MetadataMessageType::from_byte(int("msg_type")?)
            .ok_or_else(|| PeerError::Extension("invalid msg_type".into()))?;
        let piece = u32::try_from(int("piece")?)
            .map_err(|_| PeerError::Extension("invalid piece".into()))?;

        let (total_size, data) = match msg_type {
            MetadataMessageType::Data => {
                let total_size = u32::try_from(int("total_size")?)
                    .map_err(|_| PeerError::Extension("invalid total_size".into()))?;
                let data = Bytes::copy_from_slice(&payload[dict_len..]);
                (Some(total_size), Some(data))
            }
            _ => (None, None),
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Number of metadata pieces for a given metadata size.
pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Size of metadata piece `piece`; zero past the end.
pub fn metadata_piece_size(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    if offset >= total_size {
        0
    } else {
        (total_size - offset).min(METADATA_PIECE_SIZE)
    }
}
