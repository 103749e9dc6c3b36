use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace};

use super::Torrent;
use crate::constants::{MAX_REQUEST_LENGTH, METADATA_PIECE_SIZE, UT_METADATA};
use crate::metainfo::Info;
use crate::peer::{
    Bitfield, ExtensionMessage, Message, MetadataMessage, MetadataMessageType, PeerKey,
    PeerMessage,
};
use crate::storage::Storage;
use crate::torrent::error::TorrentError;
use crate::torrent::event::TorrentEvent;

fn fast_only(message: &Message) -> bool {
    matches!(
        message,
        Message::HaveAll
            | Message::HaveNone
            | Message::AllowedFast { .. }
            | Message::Reject { .. }
            | Message::Suggest { .. }
    )
}

impl<St: Storage> Torrent<St> {
    /// Applies one message from `key`. A peer that breaks the protocol is
    /// closed here; only torrent-level failures are returned.
    pub fn handle_message(
        &mut self,
        key: PeerKey,
        message: PeerMessage,
        now: Instant,
    ) -> Result<(), TorrentError> {
        if !self.peers.contains_key(&key) {
            return Ok(());
        }
        let result = match message {
            PeerMessage::Wire(message) => self.handle_wire(key, message, now),
            PeerMessage::Extension(message) => self.handle_extension(key, message, now),
        };
        match result {
            Err(e) if !e.is_fatal() => {
                self.close_peer(key, &e);
                self.start_piece_downloaders(now);
                self.start_info_downloaders(now);
                Ok(())
            }
            other => other,
        }
    }

    fn handle_wire(&mut self, key: PeerKey, message: Message, now: Instant) -> Result<(), TorrentError> {
        let Some(peer) = self.peers.get_mut(&key) else {
            return Ok(());
        };
        if fast_only(&message) && !peer.handle.supports_fast() {
            return Err(TorrentError::violation(format!(
                "{} without fast extension",
                message.name()
            )));
        }

        if self.info.is_none() {
            match message {
                Message::Have { .. }
                | Message::Bitfield(_)
                | Message::HaveAll
                | Message::HaveNone
                | Message::AllowedFast { .. } => {
                    if peer.pending.len() >= self.config.max_pending_messages {
                        return Err(TorrentError::violation("too many messages before metadata"));
                    }
                    peer.pending.push_back(message);
                    return Ok(());
                }
                Message::Request { .. } | Message::Piece { .. } | Message::Reject { .. } => {
                    return Err(TorrentError::violation(format!(
                        "{} before metadata",
                        message.name()
                    )));
                }
                _ => {}
            }
        }

        match message {
            Message::KeepAlive | Message::Port(_) | Message::Cancel { .. } => {}
            Message::Suggest { piece } => trace!("peer {}: suggests piece {}", key, piece),
            Message::Choke => self.on_choke(key, now),
            Message::Unchoke => self.on_unchoke(key, now),
            Message::Interested => peer.choking.peer_interested = true,
            Message::NotInterested => peer.choking.peer_interested = false,
            Message::Have { piece } => self.on_have(key, piece, now)?,
            Message::Bitfield(payload) => self.on_bitfield(key, &payload, now)?,
            Message::HaveAll => self.on_have_all(key, now),
            Message::HaveNone => self.on_have_none(key),
            Message::AllowedFast { piece } => self.on_allowed_fast(key, piece, now)?,
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(key, index, begin, length)?,
            Message::Piece { index, begin, data } => self.on_piece(key, index, begin, data, now)?,
            Message::Reject {
                index,
                begin,
                length,
            } => self.on_reject(key, index, begin, length, now)?,
            Message::Extended { id, payload } => {
                let message = ExtensionMessage::decode(id, &payload)
                    .map_err(|e| TorrentError::violation(e.to_string()))?;
                self.handle_extension(key, message, now)?;
            }
        }
        Ok(())
    }

    fn check_index(&self, index: u32) -> Result<(), TorrentError> {
        let count = self.pieces.len() as u32;
        if index >= count {
            return Err(TorrentError::violation(format!(
                "piece index {} out of range ({} pieces)",
                index, count
            )));
        }
        Ok(())
    }

    fn resolve_block(&self, index: u32, begin: u32, length: u32) -> Result<usize, TorrentError> {
        self.check_index(index)?;
        self.pieces[index as usize]
            .find_block(begin, length)
            .ok_or_else(|| {
                TorrentError::violation(format!(
                    "no block at {}:{} with length {}",
                    index, begin, length
                ))
            })
    }

    fn on_have(&mut self, key: PeerKey, piece: u32, now: Instant) -> Result<(), TorrentError> {
        self.check_index(piece)?;
        self.pieces[piece as usize].having_peers.insert(key);
        self.update_interest(key);
        self.start_piece_downloaders(now);
        Ok(())
    }

    fn on_bitfield(&mut self, key: PeerKey, payload: &[u8], now: Instant) -> Result<(), TorrentError> {
        let bitfield = Bitfield::from_payload(payload, self.pieces.len())
            .map_err(|e| TorrentError::violation(format!("bitfield: {}", e)))?;
        trace!("peer {}: has {} pieces", key, bitfield.count());
        for index in bitfield.ones() {
            self.pieces[index].having_peers.insert(key);
        }
        self.update_interest(key);
        self.start_piece_downloaders(now);
        Ok(())
    }

    fn on_have_all(&mut self, key: PeerKey, now: Instant) {
        for piece in &mut self.pieces {
            piece.having_peers.insert(key);
        }
        self.update_interest(key);
        self.start_piece_downloaders(now);
    }

    fn on_have_none(&mut self, key: PeerKey) {
        for piece in &mut self.pieces {
            piece.having_peers.remove(&key);
        }
        self.update_interest(key);
    }

    fn on_allowed_fast(&mut self, key: PeerKey, piece: u32, now: Instant) -> Result<(), TorrentError> {
        self.check_index(piece)?;
        trace!("peer {}: allows piece {} while choked", key, piece);
        self.pieces[piece as usize].allowed_fast_peers.insert(key);
        self.start_piece_downloaders(now);
        Ok(())
    }

    /// Outstanding requests are lost unless the piece is allowed fast, in
    /// which case the download continues. A fast peer follows its Choke
    /// with a Reject per dropped request; those are remembered so they
    /// don't count as violations.
    fn on_choke(&mut self, key: PeerKey, now: Instant) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        peer.choking.peer_choking = true;
        let fast = peer.handle.supports_fast();
        let covered = self.downloads.get(&key).is_some_and(|d| {
            fast && self.pieces[d.piece() as usize]
                .allowed_fast_peers
                .contains(&key)
        });
        if !covered {
            if let Some(mut downloader) = self.downloads.remove(&key) {
                let piece = &mut self.pieces[downloader.piece() as usize];
                let dropped = downloader.release_all(piece);
                debug!(
                    "peer {}: choked, {} blocks of piece {} released",
                    key,
                    dropped.len(),
                    downloader.piece()
                );
                if fast {
                    peer.abandoned
                        .extend(dropped.iter().filter_map(|m| match *m {
                            Message::Cancel {
                                index,
                                begin,
                                length,
                            } => Some((index, begin, length)),
                            _ => None,
                        }));
                }
            }
        }
        self.start_piece_downloaders(now);
    }

    /// Refusals only last until the peer unchokes us again.
    fn on_unchoke(&mut self, key: PeerKey, now: Instant) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        peer.choking.peer_choking = false;
        peer.abandoned.clear();
        peer.rejected_pieces.clear();
        if let Some(downloader) = self.downloads.get_mut(&key) {
            downloader.clear_rejections();
        }
        self.refill(key, now);
        self.start_piece_downloaders(now);
    }

    fn on_request(
        &mut self,
        key: PeerKey,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        self.check_index(index)?;
        let piece_length = self.pieces[index as usize].length;
        if length == 0
            || length > MAX_REQUEST_LENGTH
            || begin as u64 + length as u64 > piece_length as u64
        {
            return Err(TorrentError::violation(format!(
                "invalid request {}:{} length {}",
                index, begin, length
            )));
        }

        let Some(peer) = self.peers.get_mut(&key) else {
            return Ok(());
        };
        let have = self
            .bitfield
            .as_ref()
            .is_some_and(|b| b.has(index as usize));
        let allowed = !peer.choking.am_choking || peer.granted_fast.contains(&index);
        if !have || !allowed {
            trace!(
                "peer {}: refusing request {}:{} (have={} allowed={})",
                key,
                index,
                begin,
                have,
                allowed
            );
            if peer.handle.supports_fast() {
                peer.send(Message::Reject {
                    index,
                    begin,
                    length,
                });
            }
            return Ok(());
        }

        let data = self.storage.read_block(index, begin, length)?;
        peer.uploaded += data.len() as u64;
        peer.send(Message::Piece { index, begin, data });
        Ok(())
    }

    fn on_piece(
        &mut self,
        key: PeerKey,
        index: u32,
        begin: u32,
        data: Bytes,
        now: Instant,
    ) -> Result<(), TorrentError> {
        let block = self.resolve_block(index, begin, data.len() as u32)?;
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.downloaded += data.len() as u64;
        }

        let piece = &mut self.pieces[index as usize];
        let Some(downloader) = self
            .downloads
            .get_mut(&key)
            .filter(|d| d.piece() == index && d.holds(block))
        else {
            trace!("peer {}: unrequested block {}:{}", key, index, begin);
            return Ok(());
        };

        self.storage.write_block(index, begin, &data)?;
        let others = downloader.receive(piece, block, now).unwrap_or_default();
        for &other in &others {
            if let Some(d) = self.downloads.get_mut(&other) {
                d.forget(block);
            }
            if let Some(p) = self.peers.get(&other) {
                p.send(Message::Cancel {
                    index,
                    begin,
                    length: data.len() as u32,
                });
            }
        }
        // Losers move on to another block or give up the download.
        for other in others {
            self.refill(other, now);
        }

        if self.pieces[index as usize].is_assembled() {
            self.finish_piece(index)?;
        } else {
            self.refill(key, now);
        }
        self.start_piece_downloaders(now);
        Ok(())
    }

    fn on_reject(
        &mut self,
        key: PeerKey,
        index: u32,
        begin: u32,
        length: u32,
        now: Instant,
    ) -> Result<(), TorrentError> {
        let block = self.resolve_block(index, begin, length)?;
        if let Some(peer) = self.peers.get_mut(&key) {
            if peer.abandoned.remove(&(index, begin, length)) {
                trace!("peer {}: reject after choke for {}:{}", key, index, begin);
                return Ok(());
            }
        }
        let Some(downloader) = self.downloads.get_mut(&key) else {
            return Err(TorrentError::violation("reject without an active download"));
        };
        if downloader.piece() != index
            || !downloader.reject(&mut self.pieces[index as usize], block)
        {
            trace!("peer {}: reject for unrequested block {}:{}", key, index, begin);
            return Ok(());
        }
        debug!("peer {}: rejected block {}:{}", key, index, begin);
        self.refill(key, now);
        self.start_piece_downloaders(now);
        Ok(())
    }

    fn handle_extension(
        &mut self,
        key: PeerKey,
        message: ExtensionMessage,
        now: Instant,
    ) -> Result<(), TorrentError> {
        match message {
            ExtensionMessage::Handshake(hs) => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    debug!(
                        "peer {} {}: extension handshake (client={:?} metadata_size={:?})",
                        key,
                        peer.handle.addr(),
                        hs.client,
                        hs.metadata_size
                    );
                    peer.extension = Some(hs);
                }
                self.start_info_downloaders(now);
                Ok(())
            }
            ExtensionMessage::Metadata(message) => match message.msg_type {
                MetadataMessageType::Request => {
                    self.serve_metadata(key, message.piece);
                    Ok(())
                }
                MetadataMessageType::Data => self.on_metadata_data(key, message, now),
                MetadataMessageType::Reject => {
                    if self.info_downloads.remove(&key).is_some() {
                        debug!("peer {}: rejected metadata piece {}", key, message.piece);
                        self.start_info_downloaders(now);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Answers a ut_metadata request from the raw info bytes, clipped at
    /// their end. Without metadata, or past its end, the request is rejected.
    fn serve_metadata(&self, key: PeerKey, piece: u32) {
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        let Some(id) = peer
            .extension
            .as_ref()
            .and_then(|hs| hs.extension_id(UT_METADATA))
        else {
            debug!("peer {}: metadata request without ut_metadata", key);
            return;
        };

        let reply = match &self.info {
            Some(info) => {
                let raw = info.raw();
                let start = piece as usize * METADATA_PIECE_SIZE;
                if start < raw.len() {
                    let end = (start + METADATA_PIECE_SIZE).min(raw.len());
                    MetadataMessage::data(piece, raw.len() as u32, raw.slice(start..end))
                } else {
                    MetadataMessage::reject(piece)
                }
            }
            None => MetadataMessage::reject(piece),
        };
        peer.send(Message::Extended {
            id,
            payload: reply.encode(),
        });
    }

    fn on_metadata_data(
        &mut self,
        key: PeerKey,
        message: MetadataMessage,
        now: Instant,
    ) -> Result<(), TorrentError> {
        let Some(downloader) = self.info_downloads.get_mut(&key) else {
            debug!("peer {}: unexpected metadata piece {}", key, message.piece);
            return Ok(());
        };
        downloader.receive(
            message.piece,
            message.total_size,
            message.data.unwrap_or_default(),
            now,
        )?;

        if !downloader.is_complete() {
            self.request_metadata(key, now);
            return Ok(());
        }

        let raw = downloader.assemble();
        self.info_downloads.remove(&key);
        match Info::verified(raw, &self.info_hash) {
            Ok(info) => self.set_info(info, now),
            Err(e) => Err(TorrentError::violation(format!("bad metadata: {}", e))),
        }
    }

    /// Installs verified metadata: builds the piece table, stops every
    /// metadata download and replays what peers sent while we waited.
    fn set_info(&mut self, info: Info, now: Instant) -> Result<(), TorrentError> {
        info!(
            "torrent {}: metadata received ({} bytes)",
            self.info_hash,
            info.metadata_size()
        );
        self.info_downloads.clear();
        self.load_info(info)?;
        self.emit(TorrentEvent::MetadataReady);

        let ours: Vec<u32> = self
            .bitfield
            .as_ref()
            .map(|b| b.ones().map(|i| i as u32).collect())
            .unwrap_or_default();
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            let Some(peer) = self.peers.get_mut(&key) else {
                continue;
            };
            for &piece in &ours {
                peer.send(Message::Have { piece });
            }
            let pending = std::mem::take(&mut peer.pending);
            self.grant_allowed_fast(key);

            for message in pending {
                if let Err(e) = self.handle_wire(key, message, now) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.close_peer(key, &e);
                    break;
                }
            }
            self.update_interest(key);
        }

        if self.is_complete() && !self.completed {
            self.completed = true;
            self.emit(TorrentEvent::Completed);
        }
        self.start_piece_downloaders(now);
        Ok(())
    }
}
