//! Length-prefixed framed transport over a TCP connection.
//!
//! Every post-handshake message is a 4-byte big-endian length prefix
//! followed by the payload, so the transport is a tokio-util [`Framed`]
//! around a codec that waits for complete frames. The 68-byte handshake has
//! no length prefix and is exchanged on the raw socket before framing
//! starts. The socket closes when the stream is dropped.
use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::{Message, MAX_FRAME_LENGTH};
use super::{PeerError, PeerResult};

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Splits the byte stream into peer wire frames.
#[derive(Debug)]
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> PeerResult<Option<Message>> {
        if src.len() < 4 {
            // Not enough data to read the length prefix.
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(PeerError::Protocol(format!(
                "Frame length {} exceeds limit",
                length
            )));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(length);
        Message::parse(&payload).map(Some)
    }
}

impl Encoder<&Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> PeerResult<()> {
        dst.extend_from_slice(&message.to_bytes());
        Ok(())
    }
}

pub struct PeerStream {
    frames: Framed<TcpStream, PeerCodec>,
}

impl PeerStream {
    /// Opens a TCP connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> PeerResult<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }

    pub fn new(stream: TcpStream) -> Self {
        Self {
            frames: Framed::new(stream, PeerCodec),
        }
    }

    /// Sends our handshake and reads the peer's, working on the raw socket
    /// because handshakes are unframed. Must run before the first
    /// [`PeerStream::read`].
    pub async fn handshake(&mut self, ours: &Handshake) -> PeerResult<Handshake> {
        let socket = self.frames.get_mut();
        socket.write_all(&ours.to_bytes()).await?;
        socket.flush().await?;
        let mut response = [0u8; HANDSHAKE_LENGTH];
        socket.read_exact(&mut response).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PeerError::Closed
            } else {
                PeerError::Io(e)
            }
        })?;
        Handshake::from_bytes(&response)
    }

    /// Reads the next complete message.
    pub async fn read(&mut self) -> PeerResult<Message> {
        self.frames.next().await.unwrap_or(Err(PeerError::Closed))
    }

    /// Serializes `message` and waits for the transport to accept it.
    pub async fn write(&mut self, message: &Message) -> PeerResult<()> {
        self.frames.send(message).await
    }
}
