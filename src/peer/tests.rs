use super::*;
use crate::config::Config;
use crate::constants::{EXTENSION_PROTOCOL_BIT, FAST_EXTENSION_BIT};
use crate::metainfo::InfoHash;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn addr() -> SocketAddr {
    "127.0.0.1:6881".parse().unwrap()
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("PW0001"));

    let custom = PeerId::with_prefix("-XX1234-");
    assert_eq!(&custom.0[..8], b"-XX1234-");
}

#[test]
fn test_handshake_layout() {
    let handshake = Handshake::new(ExtensionBitmap::local(), [1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();

    assert_eq!(encoded.len(), 68);
    assert_eq!(encoded[0], 19);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");
    assert_eq!(&encoded[20..28], &[0, 0, 0, 0, 0, 0x10, 0, 0x04]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
    assert!(decoded.reserved.supports_fast());
    assert!(decoded.reserved.supports_extension_protocol());
    assert!(!decoded.reserved.supports_dht());
}

#[test]
fn test_handshake_rejects_other_protocol() {
    let mut encoded = Handshake::new(ExtensionBitmap::local(), [1u8; 20], [2u8; 20])
        .encode()
        .to_vec();
    encoded[5] = b'X';
    assert!(Handshake::decode(&encoded).is_err());
}

#[test]
fn test_request_wire_bytes() {
    let encoded = Message::Request {
        index: 2,
        begin: 16384,
        length: 16384,
    }
    .encode();
    assert_eq!(
        &encoded[..],
        &[0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
    );
}

#[test]
fn test_fast_messages_wire_bytes() {
    assert_eq!(&Message::HaveAll.encode()[..], &[0, 0, 0, 1, 14]);
    assert_eq!(&Message::HaveNone.encode()[..], &[0, 0, 0, 1, 15]);
    assert_eq!(
        &Message::AllowedFast { piece: 5 }.encode()[..],
        &[0, 0, 0, 5, 17, 0, 0, 0, 5]
    );
    assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
}

#[test]
fn test_piece_message() {
    let data = Bytes::from_static(b"hello world");
    let msg = Message::Piece {
        index: 3,
        begin: 32768,
        data: data.clone(),
    };

    let encoded = msg.encode();
    assert_eq!(&encoded[..5], &[0, 0, 0, 20, 7]);
    let decoded = Message::decode(encoded.slice(4..)).unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn test_decode_checks_payload_length() {
    // have with a 3 byte index
    let body = Bytes::from_static(&[4, 0, 0, 1]);
    assert!(matches!(
        Message::decode(body),
        Err(PeerError::InvalidMessage(_))
    ));

    // unchoke carrying a stray byte
    let body = Bytes::from_static(&[1, 0]);
    assert!(Message::decode(body).is_err());

    let body = Bytes::from_static(&[42]);
    assert!(matches!(
        Message::decode(body),
        Err(PeerError::InvalidMessageId(42))
    ));

    assert_eq!(Message::decode(Bytes::new()).unwrap(), Message::KeepAlive);
}

#[test]
fn test_effective_extensions_are_intersection() {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for _ in 0..256 {
        let a = ExtensionBitmap(next().to_be_bytes());
        let b = ExtensionBitmap(next().to_be_bytes());
        let effective = a.and(&b);
        assert_eq!(effective.as_u64() & !a.as_u64(), 0);
        assert_eq!(effective.as_u64() & !b.as_u64(), 0);
        assert_eq!(effective.as_u64(), a.as_u64() & b.as_u64());
    }
}

#[test]
fn test_extension_bit_positions() {
    let mut bits = ExtensionBitmap::default();
    bits.set(EXTENSION_PROTOCOL_BIT);
    assert_eq!(bits.0, [0, 0, 0, 0, 0, 0x10, 0, 0]);
    bits.set(FAST_EXTENSION_BIT);
    assert_eq!(bits.0[7], 0x04);
}

#[test]
fn test_extension_handshake() {
    let mut hs = ExtensionHandshake::local("peerwire test", 250, Some(300_000));
    hs.extensions.insert("ut_pex".to_string(), 1);

    let decoded = ExtensionHandshake::decode(&hs.encode()).unwrap();
    assert_eq!(decoded.extension_id("ut_pex"), Some(1));
    assert_eq!(decoded.extension_id("ut_metadata"), Some(3));
    assert_eq!(decoded.client.as_deref(), Some("peerwire test"));
    assert_eq!(decoded.metadata_offer(), Some(300_000));
}

#[test]
fn test_metadata_offer_needs_ut_metadata() {
    let mut hs = ExtensionHandshake::new();
    hs.metadata_size = Some(1000);
    assert_eq!(hs.metadata_offer(), None);
}

#[test]
fn test_unknown_extended_id_is_rejected() {
    assert!(ExtensionMessage::decode(9, b"de").is_err());
    assert!(matches!(
        ExtensionMessage::decode(0, b"d1:md11:ut_metadatai3eee").unwrap(),
        ExtensionMessage::Handshake(_)
    ));
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}

fn negotiator(config: &Config) -> HandshakeNegotiator {
    HandshakeNegotiator::new(config, PeerId::generate())
}

async fn negotiate_pair(
    outgoing: &Config,
    incoming: &Config,
    encrypt: bool,
) -> (
    Result<Negotiated, HandshakeError>,
    Result<Negotiated, HandshakeError>,
) {
    let info_hash = InfoHash([0x42; 20]);
    let (a, b) = duplex(64 * 1024);
    let dialer = negotiator(outgoing);
    let acceptor = negotiator(incoming);

    tokio::join!(
        dialer.outgoing(a, &info_hash, encrypt),
        acceptor.incoming(b, &info_hash)
    )
}

#[tokio::test]
async fn test_plaintext_handshake() {
    let config = Config::default();
    let (out, inc) = negotiate_pair(&config, &config, false).await;
    let out = out.unwrap();
    let inc = inc.unwrap();

    assert_eq!(out.cipher, Cipher::Plaintext);
    assert_eq!(inc.cipher, Cipher::Plaintext);
    assert_eq!(out.info_hash, InfoHash([0x42; 20]));
    assert_eq!(inc.info_hash, InfoHash([0x42; 20]));
    assert!(out.extensions.supports_fast());
    assert!(out.extensions.supports_extension_protocol());
    assert_eq!(out.extensions, inc.extensions);
}

#[tokio::test]
async fn test_encrypted_handshake_carries_traffic() {
    let config = Config::default();
    let (out, inc) = negotiate_pair(&config, &config, true).await;
    let mut out = out.unwrap();
    let mut inc = inc.unwrap();

    assert_eq!(out.cipher, Cipher::Rc4);
    assert_eq!(inc.cipher, Cipher::Rc4);
    assert_eq!(out.peer_id.client_id(), Some("PW0001"));

    out.stream.write_all(b"after handshake").await.unwrap();
    out.stream.flush().await.unwrap();
    let mut buf = [0u8; 15];
    inc.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after handshake");
}

#[tokio::test]
async fn test_forced_incoming_encryption_rejects_plaintext() {
    let outgoing = Config::default();
    let incoming = Config {
        force_incoming_encryption: true,
        ..Config::default()
    };
    let (_, inc) = negotiate_pair(&outgoing, &incoming, false).await;
    assert!(matches!(inc, Err(HandshakeError::EncryptionRequired)));
}

#[tokio::test]
async fn test_incoming_rejects_unknown_info_hash() {
    let (a, b) = duplex(64 * 1024);
    let dialer = negotiator(&Config::default());
    let acceptor = negotiator(&Config::default());
    let served = InfoHash([1; 20]);

    let (_, inc) = tokio::join!(
        dialer.outgoing(a, &InfoHash([2; 20]), false),
        acceptor.incoming(b, &served)
    );
    assert!(matches!(inc, Err(HandshakeError::UnknownInfoHash)));
}

#[tokio::test]
async fn test_outgoing_detects_info_hash_mismatch() {
    let (a, mut b) = duplex(64 * 1024);
    let dialer = negotiator(&Config::default());

    let responder = tokio::spawn(async move {
        let mut theirs = [0u8; 68];
        b.read_exact(&mut theirs).await.unwrap();
        let reply = Handshake::new(ExtensionBitmap::local(), [9; 20], [3; 20]);
        b.write_all(&reply.encode()).await.unwrap();
        b
    });

    let result = dialer.outgoing(a, &InfoHash([1; 20]), false).await;
    assert!(matches!(result, Err(HandshakeError::InfoHashMismatch)));
    drop(responder.await.unwrap());
}

#[tokio::test]
async fn test_session_forwards_messages_both_ways() {
    let config = Config::default();
    let (out, inc) = negotiate_pair(&config, &config, false).await;
    let out = out.unwrap();
    let remote = inc.unwrap();

    let stop = CancellationToken::new();
    let session = PeerSession::new(out, addr(), &stop, 1024);
    let handle = session.handle();
    let (inbox_tx, mut inbox) = mpsc::channel(16);
    let task = tokio::spawn(session.run(inbox_tx));

    let (remote_read, remote_write) = tokio::io::split(remote.stream);
    let mut remote_reader = MessageReader::new(remote_read, 1024);
    let mut remote_writer = MessageWriter::new(remote_write);

    assert!(handle.send(Message::Have { piece: 4 }));
    assert_eq!(
        remote_reader.read_message().await.unwrap(),
        Message::Have { piece: 4 }
    );

    remote_writer.send(&Message::Unchoke).await.unwrap();
    match inbox.recv().await.unwrap() {
        PeerEvent::Message { key, message } => {
            assert_eq!(key, handle.key());
            assert_eq!(message, PeerMessage::Wire(Message::Unchoke));
        }
        other => panic!("unexpected event {:?}", other),
    }

    handle.close();
    match inbox.recv().await.unwrap() {
        PeerEvent::Disconnected { key, error } => {
            assert_eq!(key, handle.key());
            assert!(error.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
    task.await.unwrap();
    assert!(!handle.send(Message::Interested));
}

#[tokio::test]
async fn test_session_closes_on_garbage() {
    let config = Config::default();
    let (out, inc) = negotiate_pair(&config, &config, false).await;
    let mut remote = inc.unwrap();

    let stop = CancellationToken::new();
    let session = PeerSession::new(out.unwrap(), addr(), &stop, 1024);
    let (inbox_tx, mut inbox) = mpsc::channel(16);
    tokio::spawn(session.run(inbox_tx));

    // length 1, message id 99
    remote.stream.write_all(&[0, 0, 0, 1, 99]).await.unwrap();
    match inbox.recv().await.unwrap() {
        PeerEvent::Disconnected { error, .. } => {
            assert!(matches!(error, Some(PeerError::InvalidMessageId(99))));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_token_closes_session() {
    let config = Config::default();
    let (out, _inc) = negotiate_pair(&config, &config, false).await;

    let stop = CancellationToken::new();
    let session = PeerSession::new(out.unwrap(), addr(), &stop, 1024);
    let (inbox_tx, mut inbox) = mpsc::channel(16);
    tokio::spawn(session.run(inbox_tx));

    stop.cancel();
    assert!(matches!(
        inbox.recv().await.unwrap(),
        PeerEvent::Disconnected { error: None, .. }
    ));
}
