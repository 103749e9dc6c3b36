use super::*;
use crate::peer::{Cipher, ExtensionBitmap, PeerId};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

fn info_hash() -> InfoHash {
    InfoHash([0x5A; 20])
}

fn plaintext_config() -> Config {
    Config {
        disable_outgoing_encryption: true,
        ..Config::default()
    }
}

#[test]
fn test_registry_rejects_duplicate_until_released() {
    let registry = PeerIdRegistry::new();
    let id = PeerId([7; 20]);

    let first = registry.try_register(id).unwrap();
    assert!(registry.try_register(id).is_none());
    assert!(registry.contains(&id));
    assert_eq!(first.peer_id(), id);

    drop(first);
    assert!(registry.is_empty());
    assert!(registry.try_register(id).is_some());
}

#[tokio::test]
async fn test_peer_list_dedups_queued_addresses() {
    let list = PeerList::new();
    let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();

    list.push([a, b, a]);
    assert_eq!(list.len(), 2);
    assert_eq!(list.next().await, Some(a));

    // handed out addresses may come back
    list.push([a]);
    assert_eq!(list.next().await, Some(b));
    assert_eq!(list.next().await, Some(a));

    list.close();
    assert_eq!(list.next().await, None);
}

#[tokio::test]
async fn test_peer_list_wakes_waiting_consumer() {
    let list = Arc::new(PeerList::new());
    let waiter = {
        let list = Arc::clone(&list);
        tokio::spawn(async move { list.next().await })
    };
    tokio::task::yield_now().await;

    let addr: SocketAddr = "10.0.0.3:51413".parse().unwrap();
    list.push([addr]);
    assert_eq!(waiter.await.unwrap(), Some(addr));
}

async fn start_manager(
    config: &Config,
    source: Arc<PeerList>,
    listener: Option<TcpListener>,
) -> (mpsc::Receiver<NewPeer>, CancellationToken, tokio::task::JoinHandle<()>) {
    let negotiator = HandshakeNegotiator::new(config, PeerId::generate());
    let manager = PeerManager::new(config, negotiator, info_hash(), source, listener);
    let (tx, rx) = mpsc::channel(8);
    let stop = CancellationToken::new();
    let task = tokio::spawn(manager.run(tx, stop.clone()));
    (rx, stop, task)
}

async fn connect_plaintext(negotiator: &HandshakeNegotiator, addr: SocketAddr) -> Negotiated {
    let stream = TcpStream::connect(addr).await.unwrap();
    negotiator
        .outgoing(stream, &info_hash(), false)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_duplicate_peer_id_is_closed_before_reaching_torrent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let source = Arc::new(PeerList::new());
    let config = plaintext_config();
    let (mut new_peers, stop, task) = start_manager(&config, source, Some(listener)).await;

    // Two remote clients sharing one peer id.
    let twin = HandshakeNegotiator::new(&config, PeerId([0x11; 20]));
    let (mut first, mut second) = tokio::join!(
        connect_plaintext(&twin, listen_addr),
        connect_plaintext(&twin, listen_addr)
    );

    let accepted = new_peers.recv().await.unwrap();
    assert_eq!(accepted.registration.peer_id(), PeerId([0x11; 20]));
    assert!(timeout(Duration::from_millis(200), new_peers.recv())
        .await
        .is_err());

    // Exactly one of the two connections was dropped by the manager.
    let mut buf = [0u8; 1];
    let first_closed = matches!(
        timeout(Duration::from_millis(200), first.stream.read(&mut buf)).await,
        Ok(Ok(0))
    );
    let second_closed = matches!(
        timeout(Duration::from_millis(200), second.stream.read(&mut buf)).await,
        Ok(Ok(0))
    );
    assert!(first_closed ^ second_closed);

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_dialer_delivers_session() {
    let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote_listener.local_addr().unwrap();
    let remote_id = PeerId([0x22; 20]);
    let remote = tokio::spawn(async move {
        let (stream, _) = remote_listener.accept().await.unwrap();
        let negotiator = HandshakeNegotiator::new(&Config::default(), remote_id);
        negotiator.incoming(stream, &info_hash()).await.unwrap()
    });

    let source = Arc::new(PeerList::new());
    source.push([remote_addr]);
    let (mut new_peers, stop, task) =
        start_manager(&Config::default(), Arc::clone(&source), None).await;

    let new_peer = new_peers.recv().await.unwrap();
    let handle = new_peer.session.handle();
    assert_eq!(handle.peer_id(), remote_id);
    assert_eq!(handle.addr(), remote_addr);
    assert_eq!(handle.cipher(), Cipher::Rc4);
    assert_eq!(handle.extensions(), ExtensionBitmap::local());

    let negotiated = remote.await.unwrap();
    assert_eq!(negotiated.cipher, Cipher::Rc4);

    stop.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stop_ends_idle_manager() {
    let source = Arc::new(PeerList::new());
    let (_new_peers, stop, task) = start_manager(&Config::default(), source, None).await;
    stop.cancel();
    timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}
