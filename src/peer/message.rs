//! Peer wire and extension protocol messages.
//!
//! Every non-handshake message is a 4-byte big-endian length prefix followed
//! by `length` payload bytes; length 0 is a keep-alive, otherwise the first
//! payload byte identifies the message. Message id 20 carries the extension
//! protocol (BEP 10), which multiplexes sub-protocols negotiated at
//! handshake time; the only sub-protocol spoken here is `ut_metadata`
//! (BEP 9).
use crate::bencode::{self, BencodeValue};

use super::{PeerError, PeerResult};
use std::collections::BTreeMap;

/// The extension id under which we accept `ut_metadata` messages, announced
/// to the peer in our extension handshake.
pub const LOCAL_UT_METADATA: u8 = 3;

/// Upper bound on a frame's payload. The largest legal message is a `Piece`
/// carrying one 16 KiB block; anything near a mebibyte is a protocol error.
pub const MAX_FRAME_LENGTH: usize = 1 << 20;

/// A complete peer wire message, excluding the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Keepalive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield(Bitfield),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    Extension(ExtensionMessage),
}

/// The pieces a peer claims to have, as sent in a `Bitfield` message.
///
/// Bits are MSB-first within each byte: byte 0 bit 7 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    pub payload: Vec<u8>,
}

impl Bitfield {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Builds a bitfield of `ceil(total / 8)` bytes with the given indices
    /// set.
    pub fn from_indices<I: IntoIterator<Item = u32>>(indices: I, total: usize) -> Self {
        let mut payload = vec![0u8; total.div_ceil(8)];
        for index in indices {
            payload[index as usize / 8] |= 1 << (7 - index % 8);
        }
        Self { payload }
    }

    pub fn has(&self, index: u32) -> bool {
        let byte = index as usize / 8;
        byte < self.payload.len() && self.payload[byte] & (1 << (7 - index % 8)) != 0
    }

    /// Returns the set indices in ascending order.
    pub fn to_indices(&self) -> Vec<u32> {
        let mut result = Vec::new();
        for (byte_index, byte) in self.payload.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << (7 - bit)) != 0 {
                    result.push((byte_index * 8 + bit) as u32);
                }
            }
        }
        result
    }
}

/// A parsed extension protocol frame (message id 20).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    Handshake(ExtensionHandshake),
    /// A `ut_metadata` message. When sending, `id` is the value the peer
    /// announced in its extension handshake; when receiving, it is
    /// [`LOCAL_UT_METADATA`].
    Metadata {
        id: u8,
        message: MetadataMessage,
    },
    /// A sub-protocol we didn't announce; tolerated and ignored.
    Unknown {
        id: u8,
    },
}

/// The extension handshake payload (extension id 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// The id under which the sender accepts `ut_metadata` messages.
    pub ut_metadata: u8,
    /// Size of the raw `info` dictionary, if the sender has it.
    pub metadata_size: Option<u64>,
}

/// A `ut_metadata` sub-protocol message (BEP 9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Vec<u8> },
    Reject { piece: u32 },
}

impl Message {
    /// Serializes the message into its length-prefixed wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::Keepalive => {}
            Message::Choke => payload.push(0),
            Message::Unchoke => payload.push(1),
            Message::Interested => payload.push(2),
            Message::NotInterested => payload.push(3),
            Message::Have { index } => {
                payload.push(4);
                payload.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bitfield) => {
                payload.push(5);
                payload.extend_from_slice(&bitfield.payload);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                payload.push(6);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, data } => {
                payload.push(7);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.push(8);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                payload.push(9);
                payload.extend_from_slice(&port.to_be_bytes());
            }
            Message::Extension(extension) => {
                payload.push(20);
                extension.encode_into(&mut payload);
            }
        }
        let mut buf = Vec::with_capacity(payload.len() + 4);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parses a message from a complete frame payload (the bytes after the
    /// length prefix). An empty payload is a keep-alive.
    pub fn parse(payload: &[u8]) -> PeerResult<Message> {
        let Some((&id, rest)) = payload.split_first() else {
            return Ok(Message::Keepalive);
        };
        match id {
            0 => expect_empty(rest, Message::Choke),
            1 => expect_empty(rest, Message::Unchoke),
            2 => expect_empty(rest, Message::Interested),
            3 => expect_empty(rest, Message::NotInterested),
            4 => Ok(Message::Have {
                index: read_u32(rest, 0)?,
            }),
            5 => Ok(Message::Bitfield(Bitfield::new(rest.to_vec()))),
            6 => Ok(Message::Request {
                index: read_u32(rest, 0)?,
                begin: read_u32(rest, 4)?,
                length: read_u32(rest, 8)?,
            }),
            7 => {
                if rest.len() < 8 {
                    return Err(PeerError::Protocol("Truncated piece message".to_string()));
                }
                Ok(Message::Piece {
                    index: read_u32(rest, 0)?,
                    begin: read_u32(rest, 4)?,
                    data: rest[8..].to_vec(),
                })
            }
            8 => Ok(Message::Cancel {
                index: read_u32(rest, 0)?,
                begin: read_u32(rest, 4)?,
                length: read_u32(rest, 8)?,
            }),
            9 => {
                if rest.len() != 2 {
                    return Err(PeerError::Protocol("Truncated port message".to_string()));
                }
                Ok(Message::Port(u16::from_be_bytes([rest[0], rest[1]])))
            }
            20 => Ok(Message::Extension(ExtensionMessage::parse(rest)?)),
            other => Err(PeerError::Protocol(format!(
                "Unknown message id: {}",
                other
            ))),
        }
    }
}

fn expect_empty(rest: &[u8], message: Message) -> PeerResult<Message> {
    if rest.is_empty() {
        Ok(message)
    } else {
        Err(PeerError::Protocol("Unexpected message payload".to_string()))
    }
}

fn read_u32(data: &[u8], pos: usize) -> PeerResult<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| PeerError::Protocol("Truncated message field".to_string()))
}

impl ExtensionMessage {
    fn encode_into(&self, payload: &mut Vec<u8>) {
        match self {
            ExtensionMessage::Handshake(handshake) => {
                payload.push(0);
                payload.extend_from_slice(&handshake.to_bencode());
            }
            ExtensionMessage::Metadata { id, message } => {
                payload.push(*id);
                message.encode_into(payload);
            }
            ExtensionMessage::Unknown { id } => payload.push(*id),
        }
    }

    fn parse(payload: &[u8]) -> PeerResult<ExtensionMessage> {
        let Some((&id, rest)) = payload.split_first() else {
            return Err(PeerError::Protocol(
                "Empty extension message".to_string(),
            ));
        };
        match id {
            0 => Ok(ExtensionMessage::Handshake(ExtensionHandshake::from_bencode(rest)?)),
            LOCAL_UT_METADATA => Ok(ExtensionMessage::Metadata {
                id,
                message: MetadataMessage::parse(rest)?,
            }),
            other => Ok(ExtensionMessage::Unknown { id: other }),
        }
    }
}

impl ExtensionHandshake {
    fn to_bencode(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        m.insert(
            b"ut_metadata".to_vec(),
            BencodeValue::Integer(self.ut_metadata as i64),
        );
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), BencodeValue::Integer(size as i64));
        }
        bencode::encode_to_bytes(&BencodeValue::Dict(dict))
    }

    fn from_bencode(payload: &[u8]) -> PeerResult<ExtensionHandshake> {
        let dict = bencode::decode(payload)?;
        let ut_metadata = dict
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| {
                PeerError::Protocol("Extension handshake missing ut_metadata".to_string())
            })?;
        let metadata_size = dict
            .get(b"metadata_size")
            .and_then(BencodeValue::as_int)
            .and_then(|size| u64::try_from(size).ok());
        Ok(ExtensionHandshake {
            ut_metadata: ut_metadata as u8,
            metadata_size,
        })
    }
}

impl MetadataMessage {
    const REQUEST: i64 = 0;
    const DATA: i64 = 1;
    const REJECT: i64 = 2;

    fn encode_into(&self, payload: &mut Vec<u8>) {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (Self::REQUEST, *piece),
            MetadataMessage::Data { piece, total_size, .. } => {
                dict.insert(
                    b"total_size".to_vec(),
                    BencodeValue::Integer(*total_size as i64),
                );
                (Self::DATA, *piece)
            }
            MetadataMessage::Reject { piece } => (Self::REJECT, *piece),
        };
        dict.insert(b"msg_type".to_vec(), BencodeValue::Integer(msg_type));
        dict.insert(b"piece".to_vec(), BencodeValue::Integer(piece as i64));
        payload.extend_from_slice(&bencode::encode_to_bytes(&BencodeValue::Dict(dict)));
        if let MetadataMessage::Data { data, .. } = self {
            payload.extend_from_slice(data);
        }
    }

    fn parse(payload: &[u8]) -> PeerResult<MetadataMessage> {
        let (end, dict) = bencode::decoder::decode_prefix(payload)?;
        let field = |key: &[u8]| {
            dict.get(key).and_then(BencodeValue::as_int).ok_or_else(|| {
                PeerError::Protocol(format!(
                    "Metadata message missing {}",
                    String::from_utf8_lossy(key)
                ))
            })
        };
        let piece = field(b"piece")? as u32;
        match field(b"msg_type")? {
            Self::REQUEST => Ok(MetadataMessage::Request { piece }),
            Self::DATA => Ok(MetadataMessage::Data {
                piece,
                total_size: field(b"total_size")? as u64,
                data: payload[end..].to_vec(),
            }),
            Self::REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::Protocol(format!(
                "Invalid metadata msg_type: {}",
                other
            ))),
        }
    }
}
