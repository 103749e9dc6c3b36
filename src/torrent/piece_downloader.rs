use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use super::piece::Piece;
use crate::peer::{Message, PeerKey};

/// Result of a timeout check on a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// Data is flowing, or nothing is outstanding.
    None,
    /// The peer just became snubbed.
    Snubbed,
    /// The peer stayed silent past the piece timeout.
    Expired,
}

/// Shared stall rule: snubbed after `request_timeout` of silence, expired
/// after `piece_timeout`.
pub(crate) fn check_stall(
    outstanding: bool,
    snubbed: &mut bool,
    last_progress: Instant,
    now: Instant,
    request_timeout: Duration,
    piece_timeout: Duration,
) -> Stall {
    if !outstanding {
        return Stall::None;
    }
    let silent = now.saturating_duration_since(last_progress);
    if silent < request_timeout {
        return Stall::None;
    }
    if !*snubbed {
        *snubbed = true;
        return Stall::Snubbed;
    }
    if silent >= piece_timeout {
        Stall::Expired
    } else {
        Stall::None
    }
}

/// Downloads one piece from one peer.
///
/// The downloader is driven by the coordinator: every method takes the
/// piece it works on so block holders stay in step with `in_flight`.
#[derive(Debug)]
pub struct PieceDownloader {
    piece: u32,
    peer: PeerKey,
    in_flight: BTreeSet<usize>,
    rejected: BTreeSet<usize>,
    last_progress: Instant,
    snubbed: bool,
}

impl PieceDownloader {
    /// Creates an idle downloader for `piece` from `peer`.
    pub fn new(piece: u32, peer: PeerKey, now: Instant) -> Self {
        Self {
            piece,
            peer,
            in_flight: BTreeSet::new(),
            rejected: BTreeSet::new(),
            last_progress: now,
            snubbed: false,
        }
    }

    pub fn piece(&self) -> u32 {
        self.piece
    }

    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    /// Number of blocks requested and not yet received.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn holds(&self, block: usize) -> bool {
        self.in_flight.contains(&block)
    }

    pub fn is_snubbed(&self) -> bool {
        self.snubbed
    }

    /// Whether the peer rejected any block of this piece.
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }

    /// Requests blocks until `queue_len` are in flight. `max_holders` is 1
    /// outside endgame. Blocks the peer rejected are not asked for again.
    pub fn fill(
        &mut self,
        piece: &mut Piece,
        queue_len: usize,
        max_holders: usize,
        now: Instant,
    ) -> Vec<Message> {
        if self.in_flight.is_empty() {
            self.last_progress = now;
        }
        let mut requests = Vec::new();
        while self.in_flight.len() < queue_len {
            let rejected = &self.rejected;
            let Some(block) = piece.next_block_for(self.peer, max_holders, |i| rejected.contains(&i))
            else {
                break;
            };
            piece.request(block, self.peer);
            self.in_flight.insert(block);
            let b = piece.block(block);
            requests.push(Message::Request {
                index: self.piece,
                begin: b.begin,
                length: b.length,
            });
        }
        requests
    }

    /// Records a delivered block. Returns the other downloaders that were
    /// waiting for it, or `None` if the block was not ours or already in.
    pub fn receive(&mut self, piece: &mut Piece, block: usize, now: Instant) -> Option<Vec<PeerKey>> {
        if !self.in_flight.remove(&block) {
            return None;
        }
        self.last_progress = now;
        self.snubbed = false;
        let holders = piece.receive(block)?;
        Some(holders.into_iter().filter(|k| *k != self.peer).collect())
    }

    /// The peer refused `block`; it goes back to missing.
    pub fn reject(&mut self, piece: &mut Piece, block: usize) -> bool {
        if !self.in_flight.remove(&block) {
            return false;
        }
        piece.release(block, self.peer);
        self.rejected.insert(block);
        true
    }

    /// Makes previously rejected blocks eligible again.
    pub fn clear_rejections(&mut self) {
        self.rejected.clear();
    }

    /// Another peer delivered `block` first.
    pub fn forget(&mut self, block: usize) {
        self.in_flight.remove(&block);
    }

    /// Gives every outstanding block back. Returns the requests dropped.
    pub fn release_all(&mut self, piece: &mut Piece) -> Vec<Message> {
        let mut dropped = Vec::with_capacity(self.in_flight.len());
        for block in std::mem::take(&mut self.in_flight) {
            piece.release(block, self.peer);
            let b = piece.block(block);
            dropped.push(Message::Cancel {
                index: self.piece,
                begin: b.begin,
                length: b.length,
            });
        }
        dropped
    }

    /// Checks the peer for a stall. Only counts while requests are out.
    pub fn check(&mut self, now: Instant, request_timeout: Duration, piece_timeout: Duration) -> Stall {
        check_stall(
            !self.in_flight.is_empty(),
            &mut self.snubbed,
            self.last_progress,
            now,
            request_timeout,
            piece_timeout,
        )
    }
}
