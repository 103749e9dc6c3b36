use std::time::Instant;

use tracing::{debug, info, warn};

use super::Torrent;
use crate::constants::UT_METADATA;
use crate::peer::{ChokeCandidate, ExtensionHandshake, Message, MetadataMessage, PeerKey};
use crate::storage::Storage;
use crate::torrent::error::TorrentError;
use crate::torrent::event::TorrentEvent;
use crate::torrent::info_downloader::InfoDownloader;
use crate::torrent::piece::BlockState;
use crate::torrent::piece_downloader::{PieceDownloader, Stall};

impl<St: Storage> Torrent<St> {
    /// Endgame starts once few enough blocks are left unrequested and more
    /// peers could be sending than there are blocks still to arrive.
    pub(super) fn in_endgame(&self) -> bool {
        let mut missing = 0;
        let mut remaining = 0;
        for piece in self.pieces.iter().filter(|p| !p.is_complete()) {
            missing += piece.count(BlockState::Missing);
            remaining += piece.blocks().len() - piece.count(BlockState::Have);
        }
        missing <= self.config.endgame_max_missing_blocks && self.available_peers() > remaining
    }

    /// Peers that could send us a block now: unchoked, not snubbed and
    /// holding a piece we lack.
    fn available_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|&(key, peer)| {
                !peer.choking.peer_choking
                    && !self.downloads.get(key).is_some_and(|d| d.is_snubbed())
                    && self
                        .pieces
                        .iter()
                        .any(|p| !p.is_complete() && p.having_peers.contains(key))
            })
            .count()
    }

    fn max_holders(&self) -> usize {
        if self.in_endgame() {
            self.config.endgame_parallel_downloads_per_piece
        } else {
            1
        }
    }

    /// Snubbed downloads and those of choking peers don't count.
    fn running_piece_downloads(&self) -> usize {
        self.downloads
            .values()
            .filter(|d| {
                !d.is_snubbed()
                    && self
                        .peers
                        .get(&d.peer())
                        .is_some_and(|p| !p.choking.peer_choking)
            })
            .count()
    }

    /// Rarest piece first, lowest index on ties.
    fn pick_piece(&self, key: PeerKey, max_holders: usize) -> Option<u32> {
        let peer = self.peers.get(&key)?;
        let fast = peer.handle.supports_fast();
        self.pieces
            .iter()
            .filter(|p| !p.is_complete() && p.having_peers.contains(&key))
            .filter(|p| {
                !peer.choking.peer_choking || (fast && p.allowed_fast_peers.contains(&key))
            })
            .filter(|p| !peer.rejected_pieces.contains(&p.index))
            .filter(|p| {
                let running = self
                    .downloads
                    .values()
                    .filter(|d| d.piece() == p.index)
                    .count();
                running < max_holders && p.next_block_for(key, max_holders, |_| false).is_some()
            })
            .min_by_key(|p| (p.having_peers.len(), p.index))
            .map(|p| p.index)
    }

    /// Pairs idle peers with pieces until the download limit is reached.
    pub(super) fn start_piece_downloaders(&mut self, now: Instant) {
        if self.info.is_none() || self.is_complete() {
            return;
        }
        let max_holders = self.max_holders();
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            if self.running_piece_downloads() >= self.config.parallel_piece_downloads {
                break;
            }
            if self.downloads.contains_key(&key) {
                continue;
            }
            let Some(index) = self.pick_piece(key, max_holders) else {
                continue;
            };
            self.downloads
                .insert(key, PieceDownloader::new(index, key, now));
            self.refill(key, now);
            if self.downloads.contains_key(&key) {
                debug!(
                    "peer {}: downloading piece {}{}",
                    key,
                    index,
                    if max_holders > 1 { " (endgame)" } else { "" }
                );
            }
        }
    }

    /// Tops up the peer's request queue. A download with nothing left to
    /// request is dropped.
    pub(super) fn refill(&mut self, key: PeerKey, now: Instant) {
        let max_holders = self.max_holders();
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        let queue_len = peer.queue_len(self.config.request_queue_length);
        let Some(downloader) = self.downloads.get_mut(&key) else {
            return;
        };
        let index = downloader.piece();
        let piece = &mut self.pieces[index as usize];
        for request in downloader.fill(piece, queue_len, max_holders, now) {
            peer.send(request);
        }
        if downloader.in_flight() == 0 {
            if downloader.has_rejections() {
                peer.rejected_pieces.insert(index);
            }
            self.downloads.remove(&key);
        }
    }

    /// Verifies an assembled piece. On success every peer learns we have
    /// it; on failure all of its blocks are downloaded again.
    pub(super) fn finish_piece(&mut self, index: u32) -> Result<(), TorrentError> {
        let holders: Vec<PeerKey> = self
            .downloads
            .iter()
            .filter(|(_, d)| d.piece() == index)
            .map(|(k, _)| *k)
            .collect();
        for key in holders {
            if let Some(mut downloader) = self.downloads.remove(&key) {
                downloader.release_all(&mut self.pieces[index as usize]);
            }
        }

        if !self.storage.verify_piece(index)? {
            warn!("torrent {}: piece {} failed hash check", self.info_hash, index);
            self.pieces[index as usize].reset();
            return Ok(());
        }

        self.pieces[index as usize].mark_complete();
        if let Some(bitfield) = self.bitfield.as_mut() {
            bitfield.set(index as usize);
        }
        debug!("torrent {}: piece {} verified", self.info_hash, index);
        self.emit(TorrentEvent::PieceCompleted(index));

        for peer in self.peers.values() {
            peer.send(Message::Have { piece: index });
        }
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.update_interest(key);
        }

        if self.is_complete() && !self.completed {
            self.completed = true;
            info!("torrent {}: download complete", self.info_hash);
            self.emit(TorrentEvent::Completed);
        }
        Ok(())
    }

    /// We are interested iff the peer has a piece we lack. Only a change
    /// is sent.
    pub(super) fn update_interest(&mut self, key: PeerKey) {
        if self.info.is_none() {
            return;
        }
        let interested = self
            .pieces
            .iter()
            .any(|p| !p.is_complete() && p.having_peers.contains(&key));
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.choking.am_interested == interested {
            return;
        }
        peer.choking.am_interested = interested;
        peer.send(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// Starts metadata downloads from peers offering it, one attempt per
    /// peer.
    pub(super) fn start_info_downloaders(&mut self, now: Instant) {
        if self.info.is_some() {
            return;
        }
        let mut running = self
            .info_downloads
            .values()
            .filter(|d| !d.is_snubbed())
            .count();
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            if running >= self.config.parallel_metadata_downloads {
                break;
            }
            if self.info_downloads.contains_key(&key) {
                continue;
            }
            let Some(peer) = self.peers.get_mut(&key) else {
                continue;
            };
            if peer.metadata_tried {
                continue;
            }
            let Some(size) = peer
                .extension
                .as_ref()
                .and_then(ExtensionHandshake::metadata_offer)
            else {
                continue;
            };
            if size > self.config.max_metadata_size {
                debug!("peer {}: metadata size {} larger than allowed", key, size);
                continue;
            }

            peer.metadata_tried = true;
            debug!(
                "peer {} {}: downloading metadata ({} bytes)",
                key,
                peer.handle.addr(),
                size
            );
            self.info_downloads
                .insert(key, InfoDownloader::new(key, size, now));
            self.request_metadata(key, now);
            running += 1;
        }
    }

    pub(super) fn request_metadata(&mut self, key: PeerKey, now: Instant) {
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        let Some(id) = peer
            .extension
            .as_ref()
            .and_then(|hs| hs.extension_id(UT_METADATA))
        else {
            return;
        };
        let Some(downloader) = self.info_downloads.get_mut(&key) else {
            return;
        };
        let queue_len = peer.queue_len(self.config.request_queue_length);
        for piece in downloader.fill(queue_len, now) {
            peer.send(Message::Extended {
                id,
                payload: MetadataMessage::request(piece).encode(),
            });
        }
    }

    /// Marks silent peers snubbed and gives up on those silent past the
    /// piece timeout.
    pub(super) fn check_stalls(&mut self, now: Instant) {
        let request_timeout = self.config.request_timeout;
        let piece_timeout = self.config.piece_timeout;

        let keys: Vec<PeerKey> = self.downloads.keys().copied().collect();
        for key in keys {
            let Some(downloader) = self.downloads.get_mut(&key) else {
                continue;
            };
            match downloader.check(now, request_timeout, piece_timeout) {
                Stall::None => {}
                Stall::Snubbed => debug!("peer {}: snubbed", key),
                Stall::Expired => {
                    let index = downloader.piece() as usize;
                    let cancels = downloader.release_all(&mut self.pieces[index]);
                    self.downloads.remove(&key);
                    if let Some(peer) = self.peers.get(&key) {
                        debug!(
                            "peer {} {}: piece {}: {}",
                            key,
                            peer.handle.addr(),
                            index,
                            TorrentError::TransferTimeout
                        );
                        for cancel in cancels {
                            peer.send(cancel);
                        }
                    }
                }
            }
        }

        let keys: Vec<PeerKey> = self.info_downloads.keys().copied().collect();
        for key in keys {
            let Some(downloader) = self.info_downloads.get_mut(&key) else {
                continue;
            };
            match downloader.check(now, request_timeout, piece_timeout) {
                Stall::None => {}
                Stall::Snubbed => debug!("peer {}: snubbed during metadata download", key),
                Stall::Expired => {
                    debug!("peer {}: metadata: {}", key, TorrentError::TransferTimeout);
                    self.info_downloads.remove(&key);
                }
            }
        }
    }

    /// Applies a choker round if one is due, then starts a new period for
    /// the transfer counters.
    pub(super) fn run_choker(&mut self, now: Instant) {
        let seeding = self.is_complete();
        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .map(|(key, peer)| ChokeCandidate {
                key: *key,
                interested: peer.choking.peer_interested,
                am_choking: peer.choking.am_choking,
                rate: if seeding {
                    peer.uploaded
                } else {
                    peer.downloaded
                },
            })
            .collect();
        let Some(flips) = self.choker.tick(now, &candidates) else {
            return;
        };

        for peer in self.peers.values_mut() {
            peer.downloaded = 0;
            peer.uploaded = 0;
        }
        for (key, unchoke) in flips {
            let Some(peer) = self.peers.get_mut(&key) else {
                continue;
            };
            peer.choking.am_choking = !unchoke;
            debug!("peer {}: {}", key, if unchoke { "unchoked" } else { "choked" });
            peer.send(if unchoke {
                Message::Unchoke
            } else {
                Message::Choke
            });
        }
    }
}
