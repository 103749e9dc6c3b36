use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::error::StorageError;
use super::Storage;
use crate::metainfo::Info;
use crate::peer::Bitfield;

#[derive(Debug, Clone)]
struct Layout {
    piece_length: u64,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
}

impl Layout {
    fn piece_range(&self, index: u32) -> Result<std::ops::Range<usize>, StorageError> {
        if index as usize >= self.hashes.len() {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        Ok(start as usize..end as usize)
    }

    fn block_range(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<std::ops::Range<usize>, StorageError> {
        let piece = self.piece_range(index)?;
        let start = piece.start + begin as usize;
        let end = start + length as usize;
        if length == 0 || end > piece.end {
            return Err(StorageError::InvalidBlock {
                piece: index,
                begin,
                length,
            });
        }
        Ok(start..end)
    }
}

/// Keeps the whole torrent in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Vec<u8>,
    layout: Option<Layout>,
}

impl MemoryStorage {
    /// Empty storage for a download.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `data`; pieces matching their hash are
    /// reported as present by `prepare`.
    pub fn seeded(data: Vec<u8>) -> Self {
        Self { data, layout: None }
    }

    /// Everything written so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn layout(&self) -> Result<&Layout, StorageError> {
        self.layout.as_ref().ok_or(StorageError::NotPrepared)
    }
}

impl Storage for MemoryStorage {
    fn prepare(&mut self, info: &Info) -> Result<Bitfield, StorageError> {
        let layout = Layout {
            piece_length: info.piece_length as u64,
            total_length: info.total_length,
            hashes: info.pieces.clone(),
        };

        if self.data.is_empty() {
            self.data = vec![0; info.total_length as usize];
        } else if self.data.len() as u64 != info.total_length {
            return Err(StorageError::SizeMismatch {
                expected: info.total_length,
                actual: self.data.len() as u64,
            });
        }
        self.layout = Some(layout);

        let mut have = Bitfield::new(info.pieces.len());
        for index in 0..info.piece_count() {
            if self.verify_piece(index)? {
                have.set(index as usize);
            }
        }
        Ok(have)
    }

    fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StorageError> {
        let range = self.layout()?.block_range(index, begin, length)?;
        Ok(Bytes::copy_from_slice(&self.data[range]))
    }

    fn write_block(&mut self, index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let range = self
            .layout()?
            .block_range(index, begin, data.len() as u32)?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn verify_piece(&self, index: u32) -> Result<bool, StorageError> {
        let layout = self.layout()?;
        let range = layout.piece_range(index)?;
        let digest = Sha1::digest(&self.data[range]);
        Ok(digest[..] == layout.hashes[index as usize])
    }
}
