use std::collections::HashSet;

use crate::constants::BLOCK_SIZE;
use crate::peer::PeerKey;

/// Number of 16 KiB blocks in a piece of `piece_length` bytes.
///
/// # Examples
///
/// ```
/// use peerwire::torrent::{compute_block_count, compute_block_length};
///
/// assert_eq!(compute_block_count(40_000), 3);
/// assert_eq!(compute_block_length(40_000, 0), 16_384);
/// assert_eq!(compute_block_length(40_000, 2), 40_000 - 2 * 16_384);
/// assert_eq!(compute_block_length(40_000, 3), 0);
/// ```
pub fn compute_block_count(piece_length: u32) -> usize {
    piece_length.div_ceil(BLOCK_SIZE) as usize
}

/// Length of block `block` of a piece; the last one may be short and
/// blocks past the end are empty.
pub fn compute_block_length(piece_length: u32, block: usize) -> u32 {
    let offset = block as u64 * BLOCK_SIZE as u64;
    let remaining = (piece_length as u64).saturating_sub(offset);
    remaining.min(BLOCK_SIZE as u64) as u32
}

/// Download state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Nobody has requested it.
    Missing,
    /// At least one downloader is waiting for it.
    Requested,
    /// Received, though the piece may not be verified yet.
    Have,
}

/// A 16 KiB slice of a piece and the downloaders that requested it.
#[derive(Debug, Clone)]
pub struct Block {
    /// Offset within the piece.
    pub begin: u32,
    pub length: u32,
    have: bool,
    holders: Vec<PeerKey>,
}

impl Block {
    pub fn state(&self) -> BlockState {
        if self.have {
            BlockState::Have
        } else if self.holders.is_empty() {
            BlockState::Missing
        } else {
            BlockState::Requested
        }
    }

    /// Downloaders waiting for this block, in request order.
    pub fn holders(&self) -> &[PeerKey] {
        &self.holders
    }
}

/// One piece of the torrent.
///
/// The block holders are the only record of who requested what: a
/// downloader adds itself with [`request`](Piece::request) and must remove
/// itself again with [`release`](Piece::release) when it gives a block up.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    blocks: Vec<Block>,
    /// Peers that announced this piece.
    pub having_peers: HashSet<PeerKey>,
    /// Peers that allow us to download this piece while choked.
    pub allowed_fast_peers: HashSet<PeerKey>,
    complete: bool,
}

impl Piece {
    /// Creates a piece with every block missing.
    pub fn new(index: u32, length: u32) -> Self {
        let blocks = (0..compute_block_count(length))
            .map(|i| Block {
                begin: i as u32 * BLOCK_SIZE,
                length: compute_block_length(length, i),
                have: false,
                holders: Vec::new(),
            })
            .collect();
        Self {
            index,
            length,
            blocks,
            having_peers: HashSet::new(),
            allowed_fast_peers: HashSet::new(),
            complete: false,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// # Panics
    ///
    /// Panics if `block` is out of range.
    pub fn block(&self, block: usize) -> &Block {
        &self.blocks[block]
    }

    /// Resolves a `(begin, length)` pair from the wire to one of our blocks.
    pub fn find_block(&self, begin: u32, length: u32) -> Option<usize> {
        if begin % BLOCK_SIZE != 0 {
            return None;
        }
        let index = (begin / BLOCK_SIZE) as usize;
        self.blocks
            .get(index)
            .filter(|b| b.length == length)
            .map(|_| index)
    }

    /// Whether the piece passed its hash check.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether every block has been received, verified or not.
    pub fn is_assembled(&self) -> bool {
        self.blocks.iter().all(|b| b.have)
    }

    /// Number of blocks in `state`.
    pub fn count(&self, state: BlockState) -> usize {
        self.blocks.iter().filter(|b| b.state() == state).count()
    }

    /// Next block `key` may request: a missing one, or in endgame one that
    /// fewer than `max_holders` downloaders hold and `key` doesn't.
    pub fn next_block_for(
        &self,
        key: PeerKey,
        max_holders: usize,
        skip: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let available = |i: &usize| !skip(*i) && !self.blocks[*i].holders.contains(&key);
        let missing = (0..self.blocks.len())
            .filter(available)
            .find(|&i| self.blocks[i].state() == BlockState::Missing);
        missing.or_else(|| {
            (0..self.blocks.len()).filter(available).find(|&i| {
                let block = &self.blocks[i];
                block.state() == BlockState::Requested && block.holders.len() < max_holders
            })
        })
    }

    /// Adds `key` to the block's holders.
    pub fn request(&mut self, block: usize, key: PeerKey) {
        let holders = &mut self.blocks[block].holders;
        if !holders.contains(&key) {
            holders.push(key);
        }
    }

    /// Removes `key` from the block's holders. Returns false if it wasn't one.
    pub fn release(&mut self, block: usize, key: PeerKey) -> bool {
        let holders = &mut self.blocks[block].holders;
        let before = holders.len();
        holders.retain(|k| *k != key);
        holders.len() != before
    }

    /// Marks the block received. The first delivery wins: returns the
    /// holders at that moment, or `None` if the block was already in.
    pub fn receive(&mut self, block: usize) -> Option<Vec<PeerKey>> {
        let block = &mut self.blocks[block];
        if block.have {
            return None;
        }
        block.have = true;
        Some(std::mem::take(&mut block.holders))
    }

    /// Marks the piece verified and every block received.
    pub fn mark_complete(&mut self) {
        self.complete = true;
        for block in &mut self.blocks {
            block.have = true;
            block.holders.clear();
        }
    }

    /// Throws away everything received, e.g. after a failed hash check.
    pub fn reset(&mut self) {
        self.complete = false;
        for block in &mut self.blocks {
            block.have = false;
            block.holders.clear();
        }
    }
}
