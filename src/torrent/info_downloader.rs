use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use super::error::TorrentError;
use super::piece_downloader::{check_stall, Stall};
use crate::peer::{metadata_piece_count, metadata_piece_size, PeerKey};

/// Fetches the info dictionary from one peer over ut_metadata.
///
/// Each metadata piece is requested at most once; a peer that rejects or
/// fails to deliver one is given up on rather than asked again.
#[derive(Debug)]
pub struct InfoDownloader {
    peer: PeerKey,
    total_size: u32,
    chunks: Vec<Option<Bytes>>,
    next: u32,
    in_flight: BTreeSet<u32>,
    last_progress: Instant,
    snubbed: bool,
}

impl InfoDownloader {
    /// Creates a download of `total_size` bytes of metadata from `peer`.
    pub fn new(peer: PeerKey, total_size: u32, now: Instant) -> Self {
        Self {
            peer,
            total_size,
            chunks: vec![None; metadata_piece_count(total_size as usize)],
            next: 0,
            in_flight: BTreeSet::new(),
            last_progress: now,
            snubbed: false,
        }
    }

    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Number of 16 KiB metadata pieces.
    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_snubbed(&self) -> bool {
        self.snubbed
    }

    /// Picks the next metadata pieces to request so that at most
    /// `queue_len` are outstanding.
    pub fn fill(&mut self, queue_len: usize, now: Instant) -> Vec<u32> {
        if self.in_flight.is_empty() {
            self.last_progress = now;
        }
        let mut pieces = Vec::new();
        while self.in_flight.len() < queue_len && self.next < self.chunk_count() {
            self.in_flight.insert(self.next);
            pieces.push(self.next);
            self.next += 1;
        }
        pieces
    }

    /// Stores a received metadata piece after checking it against what
    /// the peer announced.
    pub fn receive(
        &mut self,
        piece: u32,
        total_size: Option<u32>,
        data: Bytes,
        now: Instant,
    ) -> Result<(), TorrentError> {
        if !self.in_flight.remove(&piece) {
            return Err(TorrentError::violation(format!(
                "unrequested metadata piece {}",
                piece
            )));
        }
        if total_size != Some(self.total_size) {
            return Err(TorrentError::violation(format!(
                "metadata size changed from {} to {:?}",
                self.total_size, total_size
            )));
        }
        let expected = metadata_piece_size(piece, self.total_size as usize);
        if data.len() != expected {
            return Err(TorrentError::violation(format!(
                "metadata piece {} is {} bytes, expected {}",
                piece,
                data.len(),
                expected
            )));
        }
        self.chunks[piece as usize] = Some(data);
        self.last_progress = now;
        self.snubbed = false;
        Ok(())
    }

    /// Whether every metadata piece has arrived.
    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    /// Joins the received pieces. Only meaningful once complete.
    pub fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size as usize);
        for chunk in self.chunks.iter().flatten() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    /// Checks the peer for a stall, like [`PieceDownloader::check`](super::PieceDownloader::check).
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
