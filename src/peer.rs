//! Peer wire protocol (BEP-3, BEP-6, BEP-9, BEP-10) and connection setup.
//!
//! A connection goes through [`HandshakeNegotiator`] (optional message
//! stream encryption, then the BitTorrent handshake) and is then driven by a
//! [`PeerSession`], which forwards decoded messages to the torrent
//! coordinator and writes whatever the coordinator queues on its
//! [`PeerHandle`].

mod bitfield;
mod choking;
mod error;
mod extension;
mod fast;
mod handshake;
mod message;
mod metadata;
mod mse;
mod peer_id;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeCandidate, Choker, ChokingState};
pub use error::{HandshakeError, PeerError};
pub use extension::{ExtensionBitmap, ExtensionHandshake, ExtensionMessage};
pub use fast::allowed_fast_set;
pub use handshake::{HandshakeNegotiator, Negotiated, TorrentLookup};
pub use message::{Handshake, Message, MessageId};
pub use metadata::{
    metadata_piece_count, metadata_piece_size, MetadataMessage, MetadataMessageType,
};
pub use mse::{Cipher, CipherStream};
pub use peer_id::PeerId;
pub use session::{PeerEvent, PeerHandle, PeerKey, PeerMessage, PeerSession};
pub use transport::{BoxedStream, MessageReader, MessageWriter, PeerStream};

#[cfg(test)]
mod tests;
