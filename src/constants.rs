//! Protocol constants.
//!
//! Wire-level values fixed by the BEPs live here; tunables that users may
//! want to change live on [`Config`](crate::Config).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Default Azureus-style peer id prefix (BEP-20).
pub const DEFAULT_PEER_ID_PREFIX: &str = "-PW0001-";

/// Client name sent as `v` in the extension handshake.
pub const CLIENT_VERSION: &str = "peerwire 0.1.0";

// ============================================================================
// Peer wire protocol (BEP-3)
// ============================================================================

/// Protocol identifier sent in the handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Length of the plaintext handshake: pstrlen, pstr, reserved, info hash, peer id.
pub const HANDSHAKE_LEN: usize = 68;

/// Block size used for piece requests (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block a peer may request from us (128 KiB, as libtorrent).
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Largest frame accepted from a peer (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Keep-alive is sent after this much outbound silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A session with no inbound traffic for this long is closed.
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(180);

// ============================================================================
// Reserved bits (numbered from the high bit of byte 0)
// ============================================================================

/// Extension protocol (BEP-10): byte 5, mask 0x10.
pub const EXTENSION_PROTOCOL_BIT: usize = 43;

/// Fast extension (BEP-6): byte 7, mask 0x04.
pub const FAST_EXTENSION_BIT: usize = 61;

/// DHT (BEP-5): byte 7, mask 0x01.
pub const DHT_BIT: usize = 63;

// ============================================================================
// Extension protocol (BEP-9, BEP-10)
// ============================================================================

/// Extended message id reserved for the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Name of the metadata extension in the `m` dictionary.
pub const UT_METADATA: &str = "ut_metadata";

/// Extended message id we assign to ut_metadata.
pub const UT_METADATA_ID: u8 = 3;

/// Metadata is exchanged in pieces of this size (16 KiB).
pub const METADATA_PIECE_SIZE: usize = 16384;

/// `reqq` advertised in our extension handshake.
pub const ADVERTISED_REQUEST_QUEUE: i64 = 250;

// ============================================================================
// Fast extension (BEP-6)
// ============================================================================

/// Number of pieces in the allowed fast set we grant.
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

// ============================================================================
// Message stream encryption
// ============================================================================

/// 768-bit safe prime of the MSE Diffie-Hellman exchange (generator 2).
pub const MSE_PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

/// Diffie-Hellman generator.
pub const MSE_GENERATOR: u32 = 2;

/// Bytes of RC4 keystream thrown away before use.
pub const MSE_RC4_DISCARD: usize = 1024;

/// Largest random padding on either side of the DH exchange.
pub const MSE_MAX_PADDING: usize = 512;

/// Length of a DH public key on the wire.
pub const MSE_KEY_LEN: usize = 96;

/// `crypto_provide` / `crypto_select` flag for plaintext.
pub const CRYPTO_PLAINTEXT: u32 = 0x01;

/// `crypto_provide` / `crypto_select` flag for RC4.
pub const CRYPTO_RC4: u32 = 0x02;

// ============================================================================
// Channels
// ============================================================================

/// Capacity of the shared peer message inbox.
pub const PEER_INBOX_CAPACITY: usize = 1024;

/// Capacity of the new-session intake channel.
pub const NEW_PEERS_CAPACITY: usize = 64;

/// Capacity of the torrent event broadcast.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
