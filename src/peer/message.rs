use super::error::PeerError;
use super::extension::ExtensionBitmap;
use crate::constants::{HANDSHAKE_LEN, PROTOCOL};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire id of a peer message. Keep-alive has no id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// The 68-byte BitTorrent handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The 8 reserved bytes.
    pub reserved: ExtensionBitmap,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a handshake.
    pub fn new(reserved: ExtensionBitmap, info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Encodes the full 68 bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved.0);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Returns true if `data` starts with the plaintext protocol header.
    pub fn is_header(data: &[u8]) -> bool {
        data.len() >= 1 + PROTOCOL.len()
            && data[0] as usize == PROTOCOL.len()
            && &data[1..1 + PROTOCOL.len()] == PROTOCOL
    }

    /// Decodes a handshake from the first 68 bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || !Self::is_header(data) {
            return Err(PeerError::InvalidMessage("invalid handshake".into()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved: ExtensionBitmap(reserved),
            info_hash,
            peer_id,
        })
    }
}

/// A peer wire message, one variant per message id.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use peerwire::Message;
///
/// let frame = Message::Have { piece: 7 }.encode();
/// assert_eq!(&frame[..], &[0, 0, 0, 5, 4, 0, 0, 0, 7]);
///
/// let body = Bytes::copy_from_slice(&frame[4..]);
/// assert_eq!(Message::decode(body).unwrap(), Message::Have { piece: 7 });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The sender completed `piece`.
    Have { piece: u32 },
    /// Raw bitfield payload; only valid as the first message.
    Bitfield(Bytes),
    /// Asks for `length` bytes of piece `index` at offset `begin`.
    Request { index: u32, begin: u32, length: u32 },
    /// One block of piece data.
    Piece { index: u32, begin: u32, data: Bytes },
    /// Withdraws an earlier request.
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port; parsed and ignored.
    Port(u16),
    // Fast extension
    /// Hints that `piece` is worth requesting.
    Suggest { piece: u32 },
    /// The sender has every piece.
    HaveAll,
    /// The sender has no pieces.
    HaveNone,
    /// The sender will not serve this request.
    Reject { index: u32, begin: u32, length: u32 },
    /// `piece` may be requested even while choked.
    AllowedFast { piece: u32 },
    // Extension protocol
    /// Extended message with the receiver-assigned `id`.
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Short name for logging; never includes payload bytes.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Port(_) => "port",
            Message::Suggest { .. } => "suggest",
            Message::HaveAll => "have all",
            Message::HaveNone => "have none",
            Message::Reject { .. } => "reject",
            Message::AllowedFast { .. } => "allowed fast",
            Message::Extended { .. } => "extended",
        }
    }

    /// Encodes the length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the length-prefixed frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let (id, body_len) = match self {
            Message::KeepAlive => {
                buf.put_u32(0);
                return;
            }
            Message::Choke => (MessageId::Choke, 0),
            Message::Unchoke => (MessageId::Unchoke, 0),
            Message::Interested => (MessageId::Interested, 0),
            Message::NotInterested => (MessageId::NotInterested, 0),
            Message::HaveAll => (MessageId::HaveAll, 0),
            Message::HaveNone => (MessageId::HaveNone, 0),
            Message::Have { .. } => (MessageId::Have, 4),
            Message::Suggest { .. } => (MessageId::Suggest, 4),
            Message::AllowedFast { .. } => (MessageId::AllowedFast, 4),
            Message::Port(_) => (MessageId::Port, 2),
            Message::Request { .. } => (MessageId::Request, 12),
            Message::Cancel { .. } => (MessageId::Cancel, 12),
            Message::Reject { .. } => (MessageId::Reject, 12),
            Message::Bitfield(bits) => (MessageId::Bitfield, bits.len()),
            Message::Piece { data, .. } => (MessageId::Piece, 8 + data.len()),
            Message::Extended { payload, .. } => (MessageId::Extended, 1 + payload.len()),
        };

        buf.reserve(5 + body_len);
        buf.put_u32(1 + body_len as u32);
        buf.put_u8(id as u8);

        match self {
            Message::Have { piece }
            | Message::Suggest { piece }
            | Message::AllowedFast { piece } => buf.put_u32(*piece),
            Message::Port(port) => buf.put_u16(*port),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            _ => {}
        }
    }

    /// Decodes a frame body (message id and payload, without the length
    /// prefix). An empty body is a keep-alive.
    pub fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(body.get_u8())?;
        let expect = |len: usize, name: &str| {
            if body.remaining() == len {
                Ok(())
            } else {
                Err(PeerError::InvalidMessage(format!(
                    "{} payload is {} bytes, expected {}",
                    name,
                    body.remaining(),
                    len
                )))
            }
        };

        let message = match id {
            MessageId::Choke => {
                expect(0, "choke")?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0, "unchoke")?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0, "interested")?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0, "not interested")?;
                Message::NotInterested
            }
            MessageId::HaveAll => {
                expect(0, "have all")?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                expect(0, "have none")?;
                Message::HaveNone
            }
            MessageId::Have => {
                expect(4, "have")?;
                Message::Have {
                    piece: body.get_u32(),
                }
            }
            MessageId::Suggest => {
                expect(4, "suggest")?;
                Message::Suggest {
                    piece: body.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect(4, "allowed fast")?;
                Message::AllowedFast {
                    piece: body.get_u32(),
                }
            }
            MessageId::Port => {
                expect(2, "port")?;
                Message::Port(body.get_u16())
            }
            MessageId::Request => {
                expect(12, "request")?;
                Message::Request {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            MessageId::Cancel => {
                expect(12, "cancel")?;
                Message::Cancel {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            MessageId::Reject => {
                expect(12, "reject")?;
                Message::Reject {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(body),
            MessageId::Piece => {
                if body.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: body,
                }
            }
            MessageId::Extended => {
                if body.remaining() < 1 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let id = body.get_u8();
                Message::Extended { id, payload: body }
            }
        };

        Ok(message)
    }
}
