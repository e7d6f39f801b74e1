//! Peer wire protocol: handshake, messages, framed transport, and the
//! per-connection download state machine.
use thiserror::Error;
pub mod connection;
pub mod handshake;
pub mod message;
pub mod stream;

pub use handshake::Handshake;
pub use message::{Bitfield, ExtensionHandshake, ExtensionMessage, Message, MetadataMessage};
pub use stream::PeerStream;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Peer sent data failing the piece hash check")]
    InvalidData,

    #[error("Block request timed out")]
    RequestTimeout,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
