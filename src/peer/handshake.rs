use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::error::{HandshakeError, PeerError};
use super::extension::ExtensionBitmap;
use super::message::Handshake;
use super::mse::{self, Cipher};
use super::peer_id::PeerId;
use super::transport::{read_handshake, write_handshake, BoxedStream, PeerStream};
use crate::config::Config;
use crate::constants::{CRYPTO_PLAINTEXT, CRYPTO_RC4, PROTOCOL};
use crate::metainfo::InfoHash;

/// Resolves which torrent an incoming connection is for.
pub trait TorrentLookup: Send + Sync {
    /// Maps `HASH('req2', info_hash)` from an obfuscated handshake back to
    /// the info hash.
    fn find_by_skey_hash(&self, skey_hash: &[u8; 20]) -> Option<InfoHash>;

    /// Whether connections for `info_hash` are currently accepted.
    fn accepts(&self, info_hash: &InfoHash) -> bool;
}

impl TorrentLookup for InfoHash {
    fn find_by_skey_hash(&self, skey_hash: &[u8; 20]) -> Option<InfoHash> {
        (skey_hash == &req2_hash(self)).then_some(*self)
    }

    fn accepts(&self, info_hash: &InfoHash) -> bool {
        self == info_hash
    }
}

fn req2_hash(info_hash: &InfoHash) -> [u8; 20] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(b"req2");
    hasher.update(info_hash.as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// A connection that completed the BitTorrent handshake.
pub struct Negotiated {
    pub stream: BoxedStream,
    pub cipher: Cipher,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Reserved bits exactly as the remote sent them.
    pub remote_extensions: ExtensionBitmap,
    /// Capabilities both sides advertised.
    pub extensions: ExtensionBitmap,
}

/// Performs encryption negotiation and the BitTorrent handshake in both
/// directions.
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    peer_id: PeerId,
    extensions: ExtensionBitmap,
    disable_outgoing_encryption: bool,
    force_outgoing_encryption: bool,
    force_incoming_encryption: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl HandshakeNegotiator {
    /// Creates a negotiator advertising [`ExtensionBitmap::local`] under
    /// the encryption policy of `config`.
    pub fn new(config: &Config, peer_id: PeerId) -> Self {
        Self {
            peer_id,
            extensions: ExtensionBitmap::local(),
            disable_outgoing_encryption: config.disable_outgoing_encryption,
            force_outgoing_encryption: config.force_outgoing_encryption,
            force_incoming_encryption: config.force_incoming_encryption,
            connect_timeout: config.peer_connect_timeout,
            handshake_timeout: config.peer_handshake_timeout,
        }
    }

    /// Our peer ID, sent in every handshake.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Connects to `addr` and negotiates, trying the obfuscated handshake
    /// first. Unless encryption is forced, a failed encrypted attempt is
    /// retried once over a fresh plaintext connection.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        info_hash: &InfoHash,
    ) -> Result<Negotiated, HandshakeError> {
        if !self.disable_outgoing_encryption {
            let stream = self.connect(addr).await?;
            match self.outgoing(stream, info_hash, true).await {
                Ok(negotiated) => return Ok(negotiated),
                Err(e) if self.force_outgoing_encryption => return Err(e),
                Err(e) => debug!(
                    "peer -> {}: encrypted handshake failed ({}), retrying in plaintext",
                    addr, e
                ),
            }
        }

        let stream = self.connect(addr).await?;
        self.outgoing(stream, info_hash, false).await
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, HandshakeError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Outbound negotiation over an established stream.
    pub async fn outgoing<S: PeerStream>(
        &self,
        stream: S,
        info_hash: &InfoHash,
        encrypt: bool,
    ) -> Result<Negotiated, HandshakeError> {
        timeout(
            self.handshake_timeout,
            self.outgoing_inner(stream, info_hash, encrypt),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)?
    }

    async fn outgoing_inner<S: PeerStream>(
        &self,
        stream: S,
        info_hash: &InfoHash,
        encrypt: bool,
    ) -> Result<Negotiated, HandshakeError> {
        let ours = Handshake::new(self.extensions, *info_hash.as_bytes(), self.peer_id.0);

        let (mut stream, cipher) = if encrypt {
            let provide = if self.force_outgoing_encryption {
                CRYPTO_RC4
            } else {
                CRYPTO_RC4 | CRYPTO_PLAINTEXT
            };
            let stream = mse::initiate(stream, info_hash, provide, &ours.encode()).await?;
            let cipher = stream.cipher();
            (Box::new(stream) as BoxedStream, cipher)
        } else {
            let mut stream: BoxedStream = Box::new(stream);
            write_handshake(&mut stream, &ours).await?;
            (stream, Cipher::Plaintext)
        };

        let theirs = read_handshake(&mut stream, &[])
            .await
            .map_err(handshake_error)?;
        if theirs.info_hash != *info_hash.as_bytes() {
            return Err(HandshakeError::InfoHashMismatch);
        }

        Ok(self.negotiated(stream, cipher, *info_hash, theirs))
    }

    /// Inbound negotiation. The first 20 bytes decide between a plaintext
    /// handshake and the obfuscated one.
    pub async fn incoming<S: PeerStream>(
        &self,
        stream: S,
        lookup: &dyn TorrentLookup,
    ) -> Result<Negotiated, HandshakeError> {
        timeout(self.handshake_timeout, self.incoming_inner(stream, lookup))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    async fn incoming_inner<S: PeerStream>(
        &self,
        mut stream: S,
        lookup: &dyn TorrentLookup,
    ) -> Result<Negotiated, HandshakeError> {
        let mut sniff = [0u8; 1 + PROTOCOL.len()];
        stream.read_exact(&mut sniff).await?;

        let plaintext = Handshake::is_header(&sniff);
        let prefix: &[u8] = if plaintext { &sniff } else { &[] };
        let (mut stream, cipher, skey) = if plaintext {
            if self.force_incoming_encryption {
                return Err(HandshakeError::EncryptionRequired);
            }
            (Box::new(stream) as BoxedStream, Cipher::Plaintext, None)
        } else {
            let (stream, skey) = mse::respond(
                stream,
                &sniff,
                |hash: &[u8; 20]| lookup.find_by_skey_hash(hash),
                !self.force_incoming_encryption,
            )
            .await?;
            let cipher = stream.cipher();
            (Box::new(stream) as BoxedStream, cipher, Some(skey))
        };

        let theirs = read_handshake(&mut stream, prefix)
            .await
            .map_err(handshake_error)?;
        let info_hash = InfoHash(theirs.info_hash);
        if skey.is_some_and(|skey| skey != info_hash) {
            return Err(HandshakeError::InfoHashMismatch);
        }
        if !lookup.accepts(&info_hash) {
            return Err(HandshakeError::UnknownInfoHash);
        }

        let ours = Handshake::new(self.extensions, theirs.info_hash, self.peer_id.0);
        write_handshake(&mut stream, &ours).await?;

        Ok(self.negotiated(stream, cipher, info_hash, theirs))
    }

    fn negotiated(
        &self,
        stream: BoxedStream,
        cipher: Cipher,
        info_hash: InfoHash,
        theirs: Handshake,
    ) -> Negotiated {
        Negotiated {
            stream,
            cipher,
            info_hash,
            peer_id: PeerId(theirs.peer_id),
            remote_extensions: theirs.reserved,
            extensions: self.extensions.and(&theirs.reserved),
        }
    }
}

fn handshake_error(e: PeerError) -> HandshakeError {
    match e {
        PeerError::InvalidMessage(_) => HandshakeError::InvalidHandshake,
        PeerError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            HandshakeError::ConnectionClosed
        }
        e => HandshakeError::Peer(e),
    }
}
