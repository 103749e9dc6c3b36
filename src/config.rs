//! Engine configuration.

use std::time::Duration;

use thiserror::Error;

use crate::constants::{CLIENT_VERSION, DEFAULT_PEER_ID_PREFIX};

/// Reasons [`Config::validate`] refuses a configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The named count or duration is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// `disable_outgoing_encryption` and `force_outgoing_encryption` are
    /// both set.
    #[error("outgoing encryption cannot be both disabled and forced")]
    ConflictingEncryption,

    /// The peer id prefix does not fit in a peer id.
    #[error("peer id prefix must be at most 20 bytes")]
    PeerIdPrefixTooLong,
}

/// Tunables for peer sessions, scheduling and connection intake.
///
/// The defaults match long-standing values used by public clients.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of peers unchoked by the regular choker round.
    pub unchoked_peers: usize,
    /// Number of peers unchoked optimistically.
    pub optimistic_unchoked_peers: usize,
    /// Max number of blocks requested from a peer but not received yet.
    pub request_queue_length: usize,
    /// Time to wait for a requested block before marking the peer snubbed.
    pub request_timeout: Duration,
    /// Max running downloads of one piece in endgame; snubbed and choked peers don't count.
    pub endgame_parallel_downloads_per_piece: usize,
    /// Endgame starts once this few blocks remain unrequested.
    pub endgame_max_missing_blocks: usize,
    /// Max number of outgoing negotiations in flight.
    pub max_peer_dial: usize,
    /// Max number of incoming negotiations in flight.
    pub max_peer_accept: usize,
    /// Running piece downloads; snubbed and choked peers don't count.
    pub parallel_piece_downloads: usize,
    /// Running metadata downloads; snubbed peers don't count.
    pub parallel_metadata_downloads: usize,
    /// Time to wait for a TCP connection to open.
    pub peer_connect_timeout: Duration,
    /// Time to wait for the whole handshake, encryption included.
    pub peer_handshake_timeout: Duration,
    /// A snubbed download that stays silent this long is abandoned and its
    /// blocks are handed to other peers.
    pub piece_timeout: Duration,
    /// Read buffer size of a single peer connection.
    pub peer_read_buffer_size: usize,
    /// Dial plaintext only.
    pub disable_outgoing_encryption: bool,
    /// Dial encrypted only; never fall back to plaintext.
    pub force_outgoing_encryption: bool,
    /// Refuse plaintext incoming connections.
    pub force_incoming_encryption: bool,
    /// Largest metadata (info dictionary) we agree to download.
    pub max_metadata_size: u32,
    /// Max messages buffered per peer while metadata is unknown.
    pub max_pending_messages: usize,
    /// Sent as `v` in the extension handshake.
    pub extension_handshake_client_version: String,
    /// Peer id is prefixed with this string (BEP-20); the rest is random.
    pub peer_id_prefix: String,
    /// Period of the regular choker round.
    pub unchoke_interval: Duration,
    /// Period of the optimistic unchoke rotation.
    pub optimistic_unchoke_interval: Duration,
    /// Period of the coordinator's timeout sweep.
    pub tick_interval: Duration,
    /// Give up if metadata cannot be obtained within this time.
    pub metadata_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unchoked_peers: 3,
            optimistic_unchoked_peers: 1,
            request_queue_length: 50,
            request_timeout: Duration::from_secs(20),
            endgame_parallel_downloads_per_piece: 2,
            endgame_max_missing_blocks: 32,
            max_peer_dial: 20,
            max_peer_accept: 20,
            parallel_piece_downloads: 10,
            parallel_metadata_downloads: 2,
            peer_connect_timeout: Duration::from_secs(5),
            peer_handshake_timeout: Duration::from_secs(10),
            piece_timeout: Duration::from_secs(30),
            peer_read_buffer_size: 32 * 1024,
            disable_outgoing_encryption: false,
            force_outgoing_encryption: false,
            force_incoming_encryption: false,
            max_metadata_size: 30 * 1024 * 1024,
            max_pending_messages: 10_000,
            extension_handshake_client_version: CLIENT_VERSION.to_string(),
            peer_id_prefix: DEFAULT_PEER_ID_PREFIX.to_string(),
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            metadata_timeout: None,
        }
    }
}

impl Config {
    /// Checks that every count and duration is positive and that the
    /// options don't contradict each other.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerwire::{Config, ConfigError};
    ///
    /// assert!(Config::default().validate().is_ok());
    ///
    /// let config = Config {
    ///     request_queue_length: 0,
    ///     ..Config::default()
    /// };
    /// assert_eq!(config.validate(), Err(ConfigError::Zero("request_queue_length")));
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("request_queue_length", self.request_queue_length),
            (
                "endgame_parallel_downloads_per_piece",
                self.endgame_parallel_downloads_per_piece,
            ),
            ("max_peer_dial", self.max_peer_dial),
            ("max_peer_accept", self.max_peer_accept),
            ("parallel_piece_downloads", self.parallel_piece_downloads),
            ("parallel_metadata_downloads", self.parallel_metadata_downloads),
            ("peer_read_buffer_size", self.peer_read_buffer_size),
            ("max_metadata_size", self.max_metadata_size as usize),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let durations = [
            ("request_timeout", self.request_timeout),
            ("peer_connect_timeout", self.peer_connect_timeout),
            ("peer_handshake_timeout", self.peer_handshake_timeout),
            ("piece_timeout", self.piece_timeout),
            ("unchoke_interval", self.unchoke_interval),
            ("optimistic_unchoke_interval", self.optimistic_unchoke_interval),
            ("tick_interval", self.tick_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.disable_outgoing_encryption && self.force_outgoing_encryption {
            return Err(ConfigError::ConflictingEncryption);
        }
        if self.peer_id_prefix.len() > 20 {
            return Err(ConfigError::PeerIdPrefixTooLong);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = Config {
            max_peer_dial: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_peer_dial")));
    }

    #[test]
    fn test_conflicting_encryption_rejected() {
        let config = Config {
            disable_outgoing_encryption: true,
            force_outgoing_encryption: true,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ConflictingEncryption));
    }
}
