use super::error::PeerError;
use super::metadata::MetadataMessage;
use crate::bencode::{decode, encode, Value};
use crate::constants::{
    DHT_BIT, EXTENSION_HANDSHAKE_ID, EXTENSION_PROTOCOL_BIT, FAST_EXTENSION_BIT, UT_METADATA,
    UT_METADATA_ID,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// The 8 reserved handshake bytes as a 64-bit capability set.
///
/// Bits are numbered from the high bit of the first byte, so bit 43 is
/// `reserved[5] & 0x10` and bit 61 is `reserved[7] & 0x04`.
///
/// # Examples
///
/// ```
/// use peerwire::ExtensionBitmap;
///
/// let remote = ExtensionBitmap([0, 0, 0, 0, 0, 0x10, 0, 0]);
/// let effective = ExtensionBitmap::local().and(&remote);
///
/// assert!(effective.supports_extension_protocol());
/// assert!(!effective.supports_fast());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ExtensionBitmap(pub [u8; 8]);

impl ExtensionBitmap {
    /// The capabilities we advertise: fast extension and extension protocol.
    pub fn local() -> Self {
        let mut bits = Self::default();
        bits.set(FAST_EXTENSION_BIT);
        bits.set(EXTENSION_PROTOCOL_BIT);
        bits
    }

    /// Sets `bit`; bits past 63 are ignored.
    pub fn set(&mut self, bit: usize) {
        if bit < 64 {
            self.0[bit / 8] |= 0x80 >> (bit % 8);
        }
    }

    /// Returns true if `bit` is set.
    pub fn has(&self, bit: usize) -> bool {
        bit < 64 && self.0[bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    /// Effective set of a session: what both sides advertised.
    pub fn and(&self, other: &ExtensionBitmap) -> ExtensionBitmap {
        let mut out = [0u8; 8];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] & other.0[i];
        }
        ExtensionBitmap(out)
    }

    /// Fast extension (BEP-6), bit 61.
    pub fn supports_fast(&self) -> bool {
        self.has(FAST_EXTENSION_BIT)
    }

    /// Extension protocol (BEP-10), bit 43.
    pub fn supports_extension_protocol(&self) -> bool {
        self.has(EXTENSION_PROTOCOL_BIT)
    }

    /// DHT, bit 63. Only recorded, never acted upon.
    pub fn supports_dht(&self) -> bool {
        self.has(DHT_BIT)
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Debug for ExtensionBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionBitmap({:016x})", self.as_u64())
    }
}

/// BEP-10 extension handshake payload.
///
/// Unknown keys are ignored on decode, and an `m` entry with id 0 disables
/// that extension.
///
/// # Examples
///
/// ```
/// use peerwire::ExtensionHandshake;
///
/// let ours = ExtensionHandshake::local("peerwire", 250, Some(40_000));
/// let theirs = ExtensionHandshake::decode(&ours.encode()).unwrap();
///
/// assert_eq!(theirs.extension_id("ut_metadata"), Some(3));
/// assert_eq!(theirs.metadata_offer(), Some(40_000));
/// assert_eq!(theirs.reqq, Some(250));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the extended message id the sender wants to receive.
    pub extensions: BTreeMap<String, u8>,
    /// Client name and version (`v`).
    pub client: Option<String>,
    /// Our address as the peer sees it.
    pub yourip: Option<Vec<u8>>,
    /// Number of outstanding requests the peer accepts.
    pub reqq: Option<i64>,
    /// Size of the info dictionary, for ut_metadata.
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// An empty handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own handshake: ut_metadata plus the metadata size once known.
    pub fn local(client: &str, reqq: i64, metadata_size: Option<u32>) -> Self {
        let mut hs = Self::new();
        hs.extensions.insert(UT_METADATA.to_string(), UT_METADATA_ID);
        hs.client = Some(client.to_string());
        hs.reqq = Some(reqq);
        hs.metadata_size = metadata_size.map(i64::from);
        hs
    }

    /// Encodes the handshake as a bencoded dictionary.
    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();

        let m = self
            .extensions
            .iter()
            .map(|(name, id)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Integer(*id as i64),
                )
            })
            .collect();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }
        if let Some(ref ip) = self.yourip {
            dict.insert(
                Bytes::from_static(b"yourip"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Integer(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    /// Decodes a handshake. Only a malformed payload or a non-dictionary
    /// root is an error; missing keys are left unset.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let mut hs = Self::new();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            for (key, val) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) else {
                    continue;
                };
                // id 0 disables an extension
                match u8::try_from(id) {
                    Ok(id) if id > 0 => {
                        hs.extensions.insert(name.to_string(), id);
                    }
                    _ => {}
                }
            }
        }

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(Value::as_str)
            .map(String::from);
        hs.yourip = dict
            .get(b"yourip".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| b.to_vec());
        hs.reqq = dict.get(b"reqq".as_slice()).and_then(Value::as_integer);
        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(Value::as_integer);

        Ok(hs)
    }

    /// Message id the peer wants for extension `name`.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    /// Declared metadata size, if the peer offers ut_metadata at all.
    pub fn metadata_offer(&self) -> Option<u32> {
        self.extension_id(UT_METADATA)?;
        self.metadata_size
            .and_then(|size| u32::try_from(size).ok())
            .filter(|&size| size > 0)
    }
}

/// A decoded extended (id 20) message.
///
/// Only extensions we advertised can arrive; anything else is rejected at
/// decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    /// Extended message id 0.
    Handshake(ExtensionHandshake),
    /// ut_metadata, under the id we advertised.
    Metadata(MetadataMessage),
}

impl ExtensionMessage {
    /// Decodes by the id *we* assigned in our handshake.
    pub fn decode(id: u8, payload: &[u8]) -> Result<Self, PeerError> {
        match id {
            EXTENSION_HANDSHAKE_ID => Ok(Self::Handshake(ExtensionHandshake::decode(payload)?)),
            UT_METADATA_ID => Ok(Self::Metadata(MetadataMessage::decode(payload)?)),
            other => Err(PeerError::Extension(format!(
                "unexpected extended message id {}",
                other
            ))),
        }
    }
}
