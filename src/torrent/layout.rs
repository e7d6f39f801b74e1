//! Piece, file, chunk, and block views of a torrent's byte layout.
//!
//! For transmission the torrent's files are concatenated and divided into
//! pieces; for hashing, a piece is the unit; for requesting, a 16 KiB block
//! is. A [`Chunk`] is the bridge between pieces and files: a maximal
//! contiguous slice of one piece that lies within one file.
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Request granularity, fixed by BEP 3.
pub const BLOCK_LENGTH: u32 = 1 << 14;

/// Piece metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Piece {
    /// 0-based position in the torrent.
    pub index: u32,
    /// Absolute offset into the concatenation of all files.
    pub begin: u64,
    /// At most the torrent-wide piece length; the last piece may be shorter.
    pub length: u32,
    /// SHA-1 digest of the piece's data.
    pub hash: [u8; 20],
}

/// File metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute offset into the concatenation of all files.
    pub begin: u64,
    pub length: u64,
    /// Path relative to the torrent's root folder.
    pub path: PathBuf,
}

/// A block within a piece; the unit of a `Request` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    /// Index of the piece this block belongs to.
    pub piece: u32,
    /// Offset within the piece, a multiple of [`BLOCK_LENGTH`].
    pub begin: u32,
    pub length: u32,
}

/// A maximal contiguous slice of one piece lying within one file.
///
/// The chunks of a piece, concatenated in order, equal the piece's data, and
/// each chunk's bytes live at offset `begin - file.begin` in its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Index into the metainfo's file list.
    pub file: usize,
    /// Index into the metainfo's piece list.
    pub piece: usize,
    /// Absolute offset into the concatenation of all files.
    pub begin: u64,
    pub length: u64,
}

impl Chunk {
    /// Offset of this chunk's bytes within its piece's data.
    pub fn piece_offset(&self, piece: &Piece) -> usize {
        (self.begin - piece.begin) as usize
    }

    /// Offset of this chunk's bytes within its file.
    pub fn file_offset(&self, file: &FileInfo) -> u64 {
        self.begin - file.begin
    }
}

/// Checks whether `data`'s SHA-1 digest equals `piece.hash`.
pub fn valid_piece_data(piece: &Piece, data: &[u8]) -> bool {
    data.len() == piece.length as usize && Sha1::digest(data).as_slice() == piece.hash
}

/// Splits `piece` into its blocks, in ascending offset order.
pub fn blocks(piece: &Piece) -> Vec<Block> {
    let mut result = Vec::new();
    let mut begin = 0;
    while begin < piece.length {
        result.push(Block {
            piece: piece.index,
            begin,
            length: BLOCK_LENGTH.min(piece.length - begin),
        });
        begin += BLOCK_LENGTH;
    }
    result
}

/// Maps each piece to its chunks by walking pieces and files in offset order,
/// emitting a chunk at every boundary crossing.
pub fn chunks(pieces: &[Piece], files: &[FileInfo]) -> Vec<Vec<Chunk>> {
    let mut result = vec![Vec::new(); pieces.len()];
    let mut i = 0;
    let mut j = 0;
    let mut begin = 0;
    while i < files.len() && j < pieces.len() {
        let file_end = files[i].begin + files[i].length;
        let piece_end = pieces[j].begin + pieces[j].length as u64;
        let (file_index, piece_index) = (i, j);
        let end = file_end.min(piece_end);
        if file_end <= piece_end {
            i += 1;
        }
        if piece_end <= file_end {
            j += 1;
        }
        result[piece_index].push(Chunk {
            file: file_index,
            piece: piece_index,
            begin,
            length: end - begin,
        });
        begin = end;
    }
    result
}
