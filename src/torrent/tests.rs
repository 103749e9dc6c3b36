use super::*;
use crate::peer::{Message, PeerKey};
use bytes::Bytes;
use std::time::{Duration, Instant};

fn requested_blocks(messages: &[Message]) -> Vec<u32> {
    messages
        .iter()
        .map(|m| match m {
            Message::Request { begin, .. } => begin / 16384,
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

#[test]
fn test_block_layout_of_short_last_block() {
    assert_eq!(compute_block_count(40_000), 3);
    assert_eq!(compute_block_length(40_000, 0), 16384);
    assert_eq!(compute_block_length(40_000, 2), 40_000 - 2 * 16384);
    assert_eq!(compute_block_length(40_000, 3), 0);

    let piece = Piece::new(0, 40_000);
    assert_eq!(piece.blocks().len(), 3);
    assert_eq!(piece.find_block(32768, 7232), Some(2));
    assert_eq!(piece.find_block(32768, 16384), None);
    assert_eq!(piece.find_block(100, 16384), None);
    assert_eq!(piece.find_block(49152, 16384), None);
}

#[test]
fn test_downloader_respects_queue_length() {
    let now = Instant::now();
    let mut piece = Piece::new(4, 5 * 16384);
    let key = PeerKey::next();
    let mut downloader = PieceDownloader::new(4, key, now);

    let requests = downloader.fill(&mut piece, 2, 1, now);
    assert_eq!(requested_blocks(&requests), vec![0, 1]);
    assert_eq!(piece.count(BlockState::Requested), 2);
    assert!(downloader.fill(&mut piece, 2, 1, now).is_empty());

    downloader.receive(&mut piece, 0, now).unwrap();
    let requests = downloader.fill(&mut piece, 2, 1, now);
    assert_eq!(requested_blocks(&requests), vec![2]);
    assert_eq!(piece.block(0).state(), BlockState::Have);
}

#[test]
fn test_block_has_single_holder_outside_endgame() {
    let now = Instant::now();
    let mut piece = Piece::new(0, 2 * 16384);
    let a = PeerKey::next();
    let b = PeerKey::next();
    let mut first = PieceDownloader::new(0, a, now);
    let mut second = PieceDownloader::new(0, b, now);

    first.fill(&mut piece, 10, 1, now);
    assert!(second.fill(&mut piece, 10, 1, now).is_empty());
    assert!(piece.blocks().iter().all(|block| block.holders() == [a]));
}

#[test]
fn test_endgame_holder_limit() {
    let now = Instant::now();
    let mut piece = Piece::new(0, 16384);
    let keys: Vec<PeerKey> = (0..3).map(|_| PeerKey::next()).collect();
    let mut downloaders: Vec<PieceDownloader> = keys
        .iter()
        .map(|&k| PieceDownloader::new(0, k, now))
        .collect();

    assert_eq!(downloaders[0].fill(&mut piece, 10, 2, now).len(), 1);
    assert_eq!(downloaders[1].fill(&mut piece, 10, 2, now).len(), 1);
    assert!(downloaders[2].fill(&mut piece, 10, 2, now).is_empty());
    assert_eq!(piece.block(0).holders(), &keys[..2]);

    // The second delivery loses.
    let others = downloaders[1].receive(&mut piece, 0, now).unwrap();
    assert_eq!(others, vec![keys[0]]);
    downloaders[0].forget(0);
    assert!(downloaders[0].receive(&mut piece, 0, now).is_none());
    assert!(piece.is_assembled());
}

#[test]
fn test_rejected_block_is_not_requested_again() {
    let now = Instant::now();
    let mut piece = Piece::new(0, 3 * 16384);
    let key = PeerKey::next();
    let mut downloader = PieceDownloader::new(0, key, now);
    downloader.fill(&mut piece, 3, 1, now);

    assert!(downloader.reject(&mut piece, 1));
    assert!(!downloader.reject(&mut piece, 1));
    assert_eq!(piece.block(1).state(), BlockState::Missing);
    assert_eq!(piece.block(0).state(), BlockState::Requested);
    assert_eq!(piece.block(2).state(), BlockState::Requested);

    assert!(downloader.fill(&mut piece, 3, 1, now).is_empty());
    assert!(downloader.has_rejections());
}

#[test]
fn test_cleared_rejection_is_requested_again() {
    let now = Instant::now();
    let mut piece = Piece::new(0, 2 * 16384);
    let mut downloader = PieceDownloader::new(0, PeerKey::next(), now);
    downloader.fill(&mut piece, 2, 1, now);
    downloader.reject(&mut piece, 0);

    downloader.clear_rejections();
    assert!(!downloader.has_rejections());
    assert_eq!(requested_blocks(&downloader.fill(&mut piece, 2, 1, now)), vec![0]);
}

#[test]
fn test_release_all_returns_blocks() {
    let now = Instant::now();
    let mut piece = Piece::new(0, 3 * 16384);
    let mut downloader = PieceDownloader::new(0, PeerKey::next(), now);
    downloader.fill(&mut piece, 3, 1, now);

    let cancels = downloader.release_all(&mut piece);
    assert_eq!(cancels.len(), 3);
    assert!(matches!(cancels[0], Message::Cancel { index: 0, begin: 0, length: 16384 }));
    assert_eq!(piece.count(BlockState::Missing), 3);
    assert_eq!(downloader.in_flight(), 0);
}

#[test]
fn test_silent_peer_is_snubbed_then_expired() {
    let start = Instant::now();
    let mut piece = Piece::new(0, 16384);
    let mut downloader = PieceDownloader::new(0, PeerKey::next(), start);
    let request_timeout = Duration::from_secs(20);
    let piece_timeout = Duration::from_secs(30);

    assert_eq!(
        downloader.check(start, request_timeout, piece_timeout),
        Stall::None
    );
    downloader.fill(&mut piece, 1, 1, start);
    assert_eq!(
        downloader.check(start + Duration::from_secs(19), request_timeout, piece_timeout),
        Stall::None
    );
    assert_eq!(
        downloader.check(start + Duration::from_secs(21), request_timeout, piece_timeout),
        Stall::Snubbed
    );
    assert!(downloader.is_snubbed());
    assert_eq!(
        downloader.check(start + Duration::from_secs(25), request_timeout, piece_timeout),
        Stall::None
    );
    assert_eq!(
        downloader.check(start + Duration::from_secs(31), request_timeout, piece_timeout),
        Stall::Expired
    );
}

#[test]
fn test_metadata_split_into_chunks() {
    let now = Instant::now();
    let mut downloader = InfoDownloader::new(PeerKey::next(), 300_000, now);
    assert_eq!(downloader.chunk_count(), 19);

    let requested = downloader.fill(100, now);
    assert_eq!(requested, (0..19).collect::<Vec<u32>>());
    assert!(downloader.fill(100, now).is_empty());

    // The last chunk is 300000 - 18 * 16384 bytes.
    assert!(downloader
        .receive(18, Some(300_000), Bytes::from(vec![0u8; 16384]), now)
        .is_err());
    let mut fresh = InfoDownloader::new(PeerKey::next(), 300_000, now);
    fresh.fill(100, now);
    fresh
        .receive(18, Some(300_000), Bytes::from(vec![0u8; 8672]), now)
        .unwrap();
    assert!(!fresh.is_complete());
}

#[test]
fn test_metadata_assembles_in_order() {
    let now = Instant::now();
    let raw: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
    let mut downloader = InfoDownloader::new(PeerKey::next(), raw.len() as u32, now);
    assert_eq!(downloader.fill(1, now), vec![0]);
    assert_eq!(downloader.fill(2, now), vec![1]);

    downloader
        .receive(1, Some(20_000), Bytes::copy_from_slice(&raw[16384..]), now)
        .unwrap();
    downloader
        .receive(0, Some(20_000), Bytes::copy_from_slice(&raw[..16384]), now)
        .unwrap();
    assert!(downloader.is_complete());
    assert_eq!(&downloader.assemble()[..], &raw[..]);
}

#[test]
fn test_metadata_rejects_unrequested_and_resized() {
    let now = Instant::now();
    let mut downloader = InfoDownloader::new(PeerKey::next(), 20_000, now);
    downloader.fill(1, now);

    assert!(matches!(
        downloader.receive(1, Some(20_000), Bytes::from(vec![0u8; 3616]), now),
        Err(TorrentError::ProtocolViolation(_))
    ));
    assert!(matches!(
        downloader.receive(0, Some(30_000), Bytes::from(vec![0u8; 16384]), now),
        Err(TorrentError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_magnet_download_over_loopback() {
    use crate::metainfo::Info;
    use crate::peer_manager::PeerList;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    let data: Vec<u8> = (0..80_000u32).map(|i| (i * 7 % 253) as u8).collect();
    let info = Info::from_data("swarm.bin", 16384, &data).unwrap();
    let info_hash = info.info_hash();
    let config = Config {
        tick_interval: Duration::from_millis(50),
        ..Config::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    let seeder = start(
        config.clone(),
        info_hash,
        Some(info),
        MemoryStorage::seeded(data),
        Arc::new(PeerList::new()),
        Some(listener),
    )
    .unwrap();

    let peers = Arc::new(PeerList::new());
    peers.push([seeder_addr]);
    let leecher = start(config, info_hash, None, MemoryStorage::new(), peers, None).unwrap();
    let mut events = leecher.events();

    let mut metadata = false;
    let finished = timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await.unwrap() {
                TorrentEvent::MetadataReady => metadata = true,
                TorrentEvent::Completed => break,
                TorrentEvent::Error(e) => panic!("leecher failed: {}", e),
                TorrentEvent::PieceCompleted(_) => {}
            }
        }
    })
    .await;

    assert!(finished.is_ok());
    assert!(metadata);
    assert!(!seeder.is_stopped());
    leecher.stop().await;
    seeder.stop().await;
}
