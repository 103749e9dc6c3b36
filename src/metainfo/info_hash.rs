use super::error::MetainfoError;
use sha1::{Digest, Sha1};
use std::fmt;

/// 20-byte SHA1 of a torrent's info dictionary; selects the swarm.
///
/// # Examples
///
/// ```
/// use peerwire::InfoHash;
///
/// let hash = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
/// assert_eq!(hash.as_bytes()[0], 0x01);
/// assert_eq!(hash.to_string(), "0123456789abcdef0123456789abcdef01234567");
/// assert!(InfoHash::from_bytes(&[0; 19]).is_err());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Reads a hash from exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| MetainfoError::InvalidInfoHashLength)?;
        Ok(Self(arr))
    }

    /// Parses 40 hex digits.
    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(MetainfoError::InvalidInfoHashLength);
        }
        let mut arr = [0u8; 20];
        for (i, byte) in arr.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetainfoError::InvalidField("info hash"))?;
        }
        Ok(Self(arr))
    }

    /// Hashes raw info dictionary bytes.
    pub fn of(raw_info: &[u8]) -> Self {
        Self(Sha1::digest(raw_info).into())
    }

    /// The raw 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
