//! On-disk layout: file allocation, piece writes, and the resume scan.
//!
//! Files are created and truncated to their final length up front, so piece
//! writes always seek into existing regions; the unwritten ranges stay
//! sparse until blocks arrive.
use crate::torrent::{chunks, valid_piece_data, Chunk, FileInfo, Metainfo, Piece};

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Creates every file with its declared length, directories included.
pub fn allocate(base: &Path, files: &[FileInfo]) -> io::Result<()> {
    for file in files {
        let path = base.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new().write(true).create(true).open(&path)?;
        handle.set_len(file.length)?;
    }
    debug!(?base, count = files.len(), "Allocated files");
    Ok(())
}

/// Writes a verified piece into the files its chunks map to.
pub fn write_piece(
    base: &Path,
    files: &[FileInfo],
    piece: &Piece,
    piece_chunks: &[Chunk],
    data: &[u8],
) -> io::Result<()> {
    for chunk in piece_chunks {
        let file = &files[chunk.file];
        let mut handle = OpenOptions::new().write(true).open(base.join(&file.path))?;
        handle.seek(SeekFrom::Start(chunk.file_offset(file)))?;
        let offset = chunk.piece_offset(piece);
        handle.write_all(&data[offset..offset + chunk.length as usize])?;
    }
    Ok(())
}

/// Reads a piece back from disk, or `None` if any of its files is missing
/// or too short to contain it.
pub fn read_piece(
    base: &Path,
    files: &[FileInfo],
    piece: &Piece,
    piece_chunks: &[Chunk],
) -> io::Result<Option<Vec<u8>>> {
    let mut data = vec![0u8; piece.length as usize];
    for chunk in piece_chunks {
        let file = &files[chunk.file];
        let mut handle = match File::open(base.join(&file.path)) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        handle.seek(SeekFrom::Start(chunk.file_offset(file)))?;
        let offset = chunk.piece_offset(piece);
        if let Err(e) = handle.read_exact(&mut data[offset..offset + chunk.length as usize]) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e);
        }
    }
    Ok(Some(data))
}

/// Hashes every piece already on disk and returns the set still missing.
/// Absent files count as absent data, not errors.
pub fn scan(metainfo: &Metainfo, base: &Path) -> io::Result<HashSet<u32>> {
    let chunk_map = chunks(&metainfo.pieces, &metainfo.files);
    let mut missing = HashSet::new();
    for piece in &metainfo.pieces {
        let piece_chunks = &chunk_map[piece.index as usize];
        let present = matches!(
            read_piece(base, &metainfo.files, piece, piece_chunks)?,
            Some(data) if valid_piece_data(piece, &data)
        );
        if !present {
            missing.insert(piece.index);
        }
    }
    debug!(
        present = metainfo.pieces.len() - missing.len(),
        total = metainfo.pieces.len(),
        "Scanned for existing pieces"
    );
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    // Two files of 3 and 5 bytes, pieces of 4 bytes: piece 0 straddles the
    // file boundary.
    fn fixture() -> (Metainfo, Vec<u8>) {
        let content = b"abcdefgh".to_vec();
        let files = vec![
            FileInfo {
                begin: 0,
                length: 3,
                path: PathBuf::from("x"),
            },
            FileInfo {
                begin: 3,
                length: 5,
                path: PathBuf::from("sub").join("y"),
            },
        ];
        let pieces = content
            .chunks(4)
            .enumerate()
            .map(|(index, data)| Piece {
                index: index as u32,
                begin: index as u64 * 4,
                length: data.len() as u32,
                hash: Sha1::digest(data).into(),
            })
            .collect();
        let metainfo = Metainfo {
            info_hash: [0; 20],
            announce_list: Vec::new(),
            pieces,
            files,
            folder: "root".to_string(),
        };
        (metainfo, content)
    }

    #[test]
    fn allocate_truncates_to_declared_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, _) = fixture();
        allocate(dir.path(), &metainfo.files).unwrap();
        assert_eq!(fs::metadata(dir.path().join("x")).unwrap().len(), 3);
        assert_eq!(
            fs::metadata(dir.path().join("sub").join("y")).unwrap().len(),
            5
        );
    }

    #[test]
    fn written_pieces_read_back_across_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, content) = fixture();
        allocate(dir.path(), &metainfo.files).unwrap();

        let chunk_map = chunks(&metainfo.pieces, &metainfo.files);
        for piece in &metainfo.pieces {
            let begin = piece.begin as usize;
            write_piece(
                dir.path(),
                &metainfo.files,
                piece,
                &chunk_map[piece.index as usize],
                &content[begin..begin + piece.length as usize],
            )
            .unwrap();
        }

        assert_eq!(fs::read(dir.path().join("x")).unwrap(), b"abc");
        assert_eq!(fs::read(dir.path().join("sub").join("y")).unwrap(), b"defgh");
        assert!(scan(&metainfo, dir.path()).unwrap().is_empty());
    }

    #[test]
    fn scan_reports_corrupt_and_absent_pieces_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, content) = fixture();
        allocate(dir.path(), &metainfo.files).unwrap();

        // Write only piece 0 correctly; piece 1's range stays zeroed.
        let chunk_map = chunks(&metainfo.pieces, &metainfo.files);
        write_piece(
            dir.path(),
            &metainfo.files,
            &metainfo.pieces[0],
            &chunk_map[0],
            &content[..4],
        )
        .unwrap();

        let missing = scan(&metainfo, dir.path()).unwrap();
        assert_eq!(missing, HashSet::from([1]));
    }

    #[test]
    fn scan_treats_missing_files_as_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (metainfo, _) = fixture();
        let missing = scan(&metainfo, dir.path()).unwrap();
        assert_eq!(missing, HashSet::from([0, 1]));
    }
}
