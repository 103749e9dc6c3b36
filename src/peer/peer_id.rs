use std::fmt;

use rand::Rng as _;

use crate::constants::DEFAULT_PEER_ID_PREFIX;

/// A 20-byte peer identifier.
///
/// Generated IDs are Azureus-style: a client prefix such as `-PW0001-`
/// followed by random bytes.
///
/// # Examples
///
/// ```
/// use peerwire::PeerId;
///
/// let id = PeerId::with_prefix("-PW0001-");
/// assert_eq!(id.client_id(), Some("PW0001"));
/// assert_eq!(PeerId::from_bytes(id.as_bytes()), Some(id));
/// assert_eq!(PeerId::from_bytes(&[0; 19]), None);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates an ID with our own client prefix.
    pub fn generate() -> Self {
        Self::with_prefix(DEFAULT_PEER_ID_PREFIX)
    }

    /// Generates an ID starting with `prefix`. At most 20 bytes of the
    /// prefix are used; the remainder is random.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
        let mut id = [0u8; 20];
        id[..prefix.len()].copy_from_slice(prefix);
        rand::rng().fill(&mut id[prefix.len()..]);
        Self(id)
    }

    /// Reads an ID from exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    /// The raw 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The six-character client tag of an Azureus-style ID.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{:02x}", byte)?;
            }
        }
        Ok(())
    }
}
