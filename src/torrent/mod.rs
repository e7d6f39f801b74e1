//! Torrent metadata model.
//!
//! This module turns a `.torrent` file into the structured representation the
//! rest of the client works with: the info hash, the flattened tracker list,
//! and the piece/file layout with its derived chunk and block views.
use thiserror::Error;
pub mod layout;
pub mod metainfo;

pub use layout::{blocks, chunks, valid_piece_data, Block, Chunk, FileInfo, Piece, BLOCK_LENGTH};
pub use metainfo::Metainfo;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
