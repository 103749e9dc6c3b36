use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Any byte stream a peer connection can run over: TCP, an MSE cipher
/// stream, or an in-memory pipe.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> PeerStream for T {}

/// Type-erased [`PeerStream`], as produced by the handshake.
pub type BoxedStream = Box<dyn PeerStream>;

/// Reads length-prefixed frames from the receive half of a connection.
pub struct MessageReader<R> {
    inner: R,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Creates a reader with `capacity` bytes of initial buffer.
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(capacity),
        }
    }

    async fn fill(&mut self, n: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < n {
            if self.inner.read_buf(&mut self.read_buf).await? == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reads the next message. Frames larger than 16 MiB are rejected
    /// before their body is buffered.
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        self.fill(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "message too large: {}",
                length
            )));
        }

        self.fill(4 + length).await?;
        self.read_buf.advance(4);
        let body = self.read_buf.split_to(length).freeze();
        Message::decode(body)
    }
}

/// Writes frames to the send half of a connection.
pub struct MessageWriter<W> {
    inner: W,
    write_buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Creates a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            write_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Encodes every message in order and writes them with one flush.
    pub async fn send_all<'a, I>(&mut self, messages: I) -> Result<(), PeerError>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        self.write_buf.clear();
        for message in messages {
            message.encode_into(&mut self.write_buf);
        }
        self.inner.write_all(&self.write_buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.send_all(std::iter::once(message)).await
    }

    /// Shuts the write half down, ignoring errors.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Writes a handshake and flushes it.
pub async fn write_handshake<S>(stream: &mut S, handshake: &Handshake) -> Result<(), PeerError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&handshake.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a 68-byte handshake, `already_read` of which were consumed by the
/// caller while sniffing the connection.
pub async fn read_handshake<S>(stream: &mut S, already_read: &[u8]) -> Result<Handshake, PeerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    let start = already_read.len().min(HANDSHAKE_LEN);
    buf[..start].copy_from_slice(&already_read[..start]);
    stream.read_exact(&mut buf[start..]).await?;
    Handshake::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_reader_splits_coalesced_frames() {
        let (a, b) = duplex(1024);
        let mut writer = MessageWriter::new(a);
        let mut reader = MessageReader::new(b, 64);

        let sent = [
            Message::Interested,
            Message::Have { piece: 7 },
            Message::KeepAlive,
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
        ];
        writer.send_all(sent.iter()).await.unwrap();

        for expected in &sent {
            assert_eq!(&reader.read_message().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_frame() {
        let (mut a, b) = duplex(1024);
        let mut reader = MessageReader::new(b, 64);
        a.write_all(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(PeerError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_closed_connection() {
        let (a, b) = duplex(1024);
        let mut reader = MessageReader::new(b, 64);
        drop(a);
        assert!(matches!(
            reader.read_message().await,
            Err(PeerError::ConnectionClosed)
        ));
    }
}
