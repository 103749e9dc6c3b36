//! Piece storage behind the coordinator.
//!
//! The torrent only talks to a [`Storage`]: blocks are written as they
//! arrive, a piece is verified once all of its blocks are in, and requests
//! from peers are served from it. [`MemoryStorage`] keeps everything in a
//! single buffer.

mod error;
mod memory;

pub use error::StorageError;
pub use memory::MemoryStorage;

use bytes::Bytes;

use crate::metainfo::Info;
use crate::peer::Bitfield;

/// Block-level access to a torrent's data.
///
/// Calls are made from the coordinator loop and must not block for long.
pub trait Storage: Send + 'static {
    /// Sets the storage up for `info` and returns the pieces already
    /// present and verified.
    fn prepare(&mut self, info: &Info) -> Result<Bitfield, StorageError>;

    fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StorageError>;

    fn write_block(&mut self, index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Checks piece `index` against its hash.
    fn verify_piece(&self, index: u32) -> Result<bool, StorageError>;
}
