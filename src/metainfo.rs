//! Torrent info dictionary ([BEP-3]) as far as the peer wire needs it.
//!
//! The info dictionary is the payload exchanged by the metadata extension
//! (BEP-9). It is only trusted after its SHA1 matches the [`InfoHash`].
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod error;
mod info;
mod info_hash;

pub use error::MetainfoError;
pub use info::Info;
pub use info_hash::InfoHash;

#[cfg(test)]
mod tests;
