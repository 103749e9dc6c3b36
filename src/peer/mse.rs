//! Message Stream Encryption (the "obfuscated" BitTorrent handshake).
//!
//! Both sides exchange 768-bit Diffie-Hellman keys followed by random
//! padding, prove knowledge of the shared secret and the torrent's info hash,
//! then agree on RC4 or plaintext for the rest of the connection. The
//! initiator's first protocol bytes (its BitTorrent handshake) ride along as
//! the encrypted initial payload.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::error::HandshakeError;
use crate::constants::{
    CRYPTO_PLAINTEXT, CRYPTO_RC4, MSE_GENERATOR, MSE_KEY_LEN, MSE_MAX_PADDING, MSE_PRIME,
    MSE_RC4_DISCARD,
};
use crate::metainfo::InfoHash;

const VC: [u8; 8] = [0; 8];

/// Stream cipher negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// Bytes pass through unchanged.
    Plaintext,
    /// RC4 with the first 1024 bytes of keystream discarded.
    Rc4,
}

impl Cipher {
    fn from_select(select: u32) -> Option<Self> {
        match select {
            CRYPTO_RC4 => Some(Cipher::Rc4),
            CRYPTO_PLAINTEXT => Some(Cipher::Plaintext),
            _ => None,
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cipher::Plaintext => f.write_str("plaintext"),
            Cipher::Rc4 => f.write_str("rc4"),
        }
    }
}

/// RC4 keystream with the first 1024 bytes discarded.
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        Self::with_discard(key, MSE_RC4_DISCARD)
    }

    fn with_discard(key: &[u8], discard: usize) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        let mut rc4 = Self { state, i: 0, j: 0 };
        rc4.apply(&mut vec![0u8; discard]);
        rc4
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[k as usize];
        }
    }
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

fn padding() -> Vec<u8> {
    let mut rng = rand::rng();
    let mut pad = vec![0u8; rng.random_range(0..=MSE_MAX_PADDING)];
    rng.fill(&mut pad[..]);
    pad
}

struct KeyPair {
    private: BigUint,
    public: [u8; MSE_KEY_LEN],
}

impl KeyPair {
    fn generate() -> Self {
        let mut secret = [0u8; 20];
        rand::rng().fill(&mut secret);
        let private = BigUint::from_bytes_be(&secret);
        let prime = BigUint::from_bytes_be(&MSE_PRIME);
        let public = BigUint::from(MSE_GENERATOR).modpow(&private, &prime);
        Self {
            private,
            public: to_key_bytes(&public),
        }
    }

    fn shared_secret(&self, remote: &[u8]) -> Result<[u8; MSE_KEY_LEN], HandshakeError> {
        let prime = BigUint::from_bytes_be(&MSE_PRIME);
        let remote = BigUint::from_bytes_be(remote);
        let one = BigUint::from(1u32);
        if remote <= one || remote >= &prime - &one {
            return Err(HandshakeError::EncryptionFailed("invalid public key".into()));
        }
        Ok(to_key_bytes(&remote.modpow(&self.private, &prime)))
    }
}

fn to_key_bytes(n: &BigUint) -> [u8; MSE_KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; MSE_KEY_LEN];
    out[MSE_KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Read side of the handshake: keeps whatever the peer sent beyond the
/// bytes consumed so far so it can be handed to the cipher stream.
struct Reader<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Reader<S> {
    async fn fill(&mut self, n: usize) -> Result<(), HandshakeError> {
        while self.buf.len() < n {
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(HandshakeError::ConnectionClosed);
            }
        }
        Ok(())
    }

    async fn take(&mut self, n: usize) -> Result<BytesMut, HandshakeError> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n))
    }

    /// Skips up to `max_skip` bytes of padding until `pattern` is found and
    /// consumes the pattern.
    async fn sync(&mut self, pattern: &[u8], max_skip: usize) -> Result<(), HandshakeError> {
        loop {
            if let Some(pos) = self
                .buf
                .windows(pattern.len())
                .position(|window| window == pattern)
            {
                if pos > max_skip {
                    break;
                }
                self.buf.advance(pos + pattern.len());
                return Ok(());
            }
            if self.buf.len() >= max_skip + pattern.len() {
                break;
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(HandshakeError::ConnectionClosed);
            }
        }
        Err(HandshakeError::EncryptionFailed("synchronisation marker not found".into()))
    }
}

/// Runs the initiating side over `stream`.
///
/// `provide` is the `crypto_provide` bitmask. `initial_payload` is sent
/// encrypted with the third handshake step so the peer's reply can follow
/// without another round trip.
pub async fn initiate<S>(
    mut stream: S,
    skey: &InfoHash,
    provide: u32,
    initial_payload: &[u8],
) -> Result<CipherStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keys = KeyPair::generate();
    let mut out = BytesMut::with_capacity(MSE_KEY_LEN + MSE_MAX_PADDING);
    out.put_slice(&keys.public);
    out.put_slice(&padding());
    stream.write_all(&out).await?;

    let mut reader = Reader {
        stream,
        buf: BytesMut::with_capacity(1024),
    };
    let remote = reader.take(MSE_KEY_LEN).await?;
    let secret = keys.shared_secret(&remote)?;

    let mut encrypt = Rc4::new(&hash(&[b"keyA", &secret, skey.as_bytes()]));
    let mut decrypt = Rc4::new(&hash(&[b"keyB", &secret, skey.as_bytes()]));

    let mut out = BytesMut::new();
    out.put_slice(&hash(&[b"req1", &secret]));
    out.put_slice(&xor20(
        &hash(&[b"req2", skey.as_bytes()]),
        &hash(&[b"req3", &secret]),
    ));
    let encrypted_from = out.len();
    out.put_slice(&VC);
    out.put_u32(provide);
    out.put_u16(0);
    out.put_u16(initial_payload.len() as u16);
    out.put_slice(initial_payload);
    encrypt.apply(&mut out[encrypted_from..]);
    reader.stream.write_all(&out).await?;

    // The responder's reply starts with VC encrypted under keyB; running
    // the decryptor over zeros both yields the marker and advances it
    // past those 8 bytes.
    let mut marker = VC;
    decrypt.apply(&mut marker);
    reader.sync(&marker, MSE_MAX_PADDING).await?;

    let mut head = reader.take(6).await?;
    decrypt.apply(&mut head);
    let select = head.get_u32();
    let pad_len = head.get_u16() as usize;
    if pad_len > MSE_MAX_PADDING {
        return Err(HandshakeError::EncryptionFailed("padding too long".into()));
    }
    let cipher = match Cipher::from_select(select) {
        Some(cipher) if select & provide != 0 => cipher,
        _ => return Err(HandshakeError::NoCommonCipher),
    };
    let mut pad = reader.take(pad_len).await?;
    decrypt.apply(&mut pad);

    let Reader { stream, buf } = reader;
    Ok(CipherStream::established(
        stream,
        cipher,
        encrypt,
        decrypt,
        BytesMut::new(),
        buf,
    ))
}

/// Runs the responding side over `stream`.
///
/// `prefix` holds bytes already read while sniffing for a plaintext
/// handshake. `find_skey` resolves `HASH('req2', SKEY)` to the info hash the
/// initiator is asking for. The returned stream yields the initiator's
/// initial payload first.
pub async fn respond<S, F>(
    stream: S,
    prefix: &[u8],
    find_skey: F,
    allow_plaintext: bool,
) -> Result<(CipherStream<S>, InfoHash), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&[u8; 20]) -> Option<InfoHash>,
{
    let mut reader = Reader {
        stream,
        buf: BytesMut::from(prefix),
    };
    let remote = reader.take(MSE_KEY_LEN).await?;

    let keys = KeyPair::generate();
    let mut out = BytesMut::with_capacity(MSE_KEY_LEN + MSE_MAX_PADDING);
    out.put_slice(&keys.public);
    out.put_slice(&padding());
    reader.stream.write_all(&out).await?;

    let secret = keys.shared_secret(&remote)?;
    reader
        .sync(&hash(&[b"req1", &secret]), MSE_MAX_PADDING)
        .await?;

    let mut obfuscated = [0u8; 20];
    obfuscated.copy_from_slice(&reader.take(20).await?);
    let skey_hash = xor20(&obfuscated, &hash(&[b"req3", &secret]));
    let info_hash = find_skey(&skey_hash).ok_or(HandshakeError::UnknownInfoHash)?;

    let mut decrypt = Rc4::new(&hash(&[b"keyA", &secret, info_hash.as_bytes()]));
    let mut encrypt = Rc4::new(&hash(&[b"keyB", &secret, info_hash.as_bytes()]));

    let mut head = reader.take(14).await?;
    decrypt.apply(&mut head);
    if head[..8] != VC {
        return Err(HandshakeError::EncryptionFailed("invalid verification constant".into()));
    }
    head.advance(8);
    let provide = head.get_u32();
    let pad_len = head.get_u16() as usize;
    if pad_len > MSE_MAX_PADDING {
        return Err(HandshakeError::EncryptionFailed("padding too long".into()));
    }
    let mut pad = reader.take(pad_len).await?;
    decrypt.apply(&mut pad);

    let mut len = reader.take(2).await?;
    decrypt.apply(&mut len);
    let payload_len = len.get_u16() as usize;
    let mut payload = reader.take(payload_len).await?;
    decrypt.apply(&mut payload);

    let (select, cipher) = if provide & CRYPTO_RC4 != 0 {
        (CRYPTO_RC4, Cipher::Rc4)
    } else if allow_plaintext && provide & CRYPTO_PLAINTEXT != 0 {
        (CRYPTO_PLAINTEXT, Cipher::Plaintext)
    } else {
        return Err(HandshakeError::NoCommonCipher);
    };

    let mut out = BytesMut::with_capacity(14);
    out.put_slice(&VC);
    out.put_u32(select);
    out.put_u16(0);
    encrypt.apply(&mut out);
    reader.stream.write_all(&out).await?;

    let Reader { stream, buf } = reader;
    Ok((
        CipherStream::established(stream, cipher, encrypt, decrypt, payload, buf),
        info_hash,
    ))
}

/// A transport after the obfuscated handshake: RC4 in both directions, or
/// pass-through when plaintext was selected.
pub struct CipherStream<S> {
    inner: S,
    cipher: Cipher,
    read_cipher: Option<Rc4>,
    write_cipher: Option<Rc4>,
    /// Decrypted bytes that arrived during the handshake.
    pending: BytesMut,
    /// Encrypted bytes not yet accepted by `inner`.
    write_buf: BytesMut,
}

impl<S> CipherStream<S> {
    fn established(
        inner: S,
        cipher: Cipher,
        encrypt: Rc4,
        mut decrypt: Rc4,
        mut pending: BytesMut,
        mut leftover: BytesMut,
    ) -> Self {
        let (read_cipher, write_cipher) = match cipher {
            Cipher::Rc4 => {
                decrypt.apply(&mut leftover);
                (Some(decrypt), Some(encrypt))
            }
            Cipher::Plaintext => (None, None),
        };
        pending.unsplit(leftover);
        Self {
            inner,
            cipher,
            read_cipher,
            write_cipher,
            pending,
            write_buf: BytesMut::new(),
        }
    }

    /// Cipher negotiated for this stream.
    pub fn cipher(&self) -> Cipher {
        self.cipher
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let filled = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(cipher) = this.read_cipher.as_mut() {
            cipher.apply(&mut buf.filled_mut()[filled..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let Some(cipher) = this.write_cipher.as_mut() else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };
        let start = this.write_buf.len();
        this.write_buf.extend_from_slice(buf);
        cipher.apply(&mut this.write_buf[start..]);
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
