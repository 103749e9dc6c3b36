use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::PeerError;
use super::extension::{ExtensionBitmap, ExtensionMessage};
use super::handshake::Negotiated;
use super::message::Message;
use super::mse::Cipher;
use super::peer_id::PeerId;
use super::transport::{BoxedStream, MessageReader, MessageWriter};
use crate::constants::{KEEPALIVE_INTERVAL, PEER_READ_TIMEOUT};

/// Largest number of queued messages written with a single flush.
const WRITE_BATCH: usize = 64;

/// Process-unique identifier of one connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(u64);

impl PeerKey {
    /// Allocates a key no other connection in this process has used.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.0)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A decoded message as delivered to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// A core or fast extension message.
    Wire(Message),
    /// A decoded extended message.
    Extension(ExtensionMessage),
}

/// What a session reports on the shared inbox.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message arrived from peer `key`.
    Message { key: PeerKey, message: PeerMessage },
    /// The session ended; `error` is `None` when it was closed from our side.
    Disconnected { key: PeerKey, error: Option<PeerError> },
}

/// The coordinator's reference to a session.
///
/// Sending never blocks; the session's writer drains the queue in order.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    key: PeerKey,
    addr: SocketAddr,
    peer_id: PeerId,
    extensions: ExtensionBitmap,
    cipher: Cipher,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl PeerHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    pub fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        extensions: ExtensionBitmap,
        cipher: Cipher,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            key: PeerKey::next(),
            addr,
            peer_id,
            extensions,
            cipher,
            outbound,
            cancel,
        };
        (handle, rx)
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Capabilities both sides advertised.
    pub fn extensions(&self) -> ExtensionBitmap {
        self.extensions
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn supports_fast(&self) -> bool {
        self.extensions.supports_fast()
    }

    /// Queues `message`. Returns false once the session has ended.
    pub fn send(&self, message: Message) -> bool {
        !self.cancel.is_cancelled() && self.outbound.send(message).is_ok()
    }

    /// Closes the connection. The session still reports `Disconnected`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the session can no longer send.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

/// One connection's message loop: `Connected -> Active -> Closed`.
pub struct PeerSession {
    handle: PeerHandle,
    stream: BoxedStream,
    outbound: mpsc::UnboundedReceiver<Message>,
    read_buffer_size: usize,
}

impl PeerSession {
    /// Wraps a negotiated connection. The session's cancellation token is a
    /// child of `parent`, so stopping the swarm closes every session.
    pub fn new(
        negotiated: Negotiated,
        addr: SocketAddr,
        parent: &CancellationToken,
        read_buffer_size: usize,
    ) -> Self {
        let (handle, outbound) = PeerHandle::new(
            addr,
            negotiated.peer_id,
            negotiated.extensions,
            negotiated.cipher,
            parent.child_token(),
        );
        Self {
            handle,
            stream: negotiated.stream,
            outbound,
            read_buffer_size,
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Runs until the connection fails, the handle is closed or every
    /// handle is dropped, then reports `Disconnected` on `inbox`.
    pub async fn run(self, inbox: mpsc::Sender<PeerEvent>) {
        let Self {
            handle,
            stream,
            mut outbound,
            read_buffer_size,
        } = self;
        let PeerHandle {
            key,
            addr,
            cancel,
            outbound: sender,
            ..
        } = handle;
        // Only the coordinator's handles keep the queue open.
        drop(sender);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half, read_buffer_size);
        let mut writer = MessageWriter::new(write_half);

        let result = tokio::select! {
            result = read_loop(&mut reader, key, addr, &inbox) => result,
            result = write_loop(&mut writer, &mut outbound, addr) => result,
            _ = cancel.cancelled() => Ok(()),
        };
        cancel.cancel();
        writer.shutdown().await;

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                debug!("peer {} {}: session closed: {}", key, addr, e);
                Some(e)
            }
        };
        let _ = inbox.send(PeerEvent::Disconnected { key, error }).await;
    }
}

async fn read_loop<R>(
    reader: &mut MessageReader<R>,
    key: PeerKey,
    addr: SocketAddr,
    inbox: &mpsc::Sender<PeerEvent>,
) -> Result<(), PeerError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let message = timeout(PEER_READ_TIMEOUT, reader.read_message())
            .await
            .map_err(|_| PeerError::Timeout)??;
        trace!("peer <- {}: {}", addr, message.name());

        let message = match message {
            Message::KeepAlive => continue,
            Message::Extended { id, payload } => {
                PeerMessage::Extension(ExtensionMessage::decode(id, &payload)?)
            }
            message => PeerMessage::Wire(message),
        };
        if inbox.send(PeerEvent::Message { key, message }).await.is_err() {
            return Ok(());
        }
    }
}

async fn write_loop<W>(
    writer: &mut MessageWriter<W>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    addr: SocketAddr,
) -> Result<(), PeerError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    loop {
        match timeout(KEEPALIVE_INTERVAL, outbound.recv()).await {
            Ok(Some(message)) => {
                batch.push(message);
                while batch.len() < WRITE_BATCH {
                    match outbound.try_recv() {
                        Ok(message) => batch.push(message),
                        Err(_) => break,
                    }
                }
                for message in &batch {
                    trace!("peer -> {}: {}", addr, message.name());
                }
                writer.send_all(batch.iter()).await?;
                batch.clear();
            }
            Ok(None) => return Ok(()),
            Err(_) => writer.send(&Message::KeepAlive).await?,
        }
    }
}
