//! `.torrent` file parsing.
//!
//! Specification: BEP 3 (the metainfo format) and BEP 12 (multitracker
//! lists). The tiered announce-list structure is flattened because the
//! client requests peers from every tracker anyway.
use crate::bencode::{self, BencodeValue};
use crate::torrent::layout::{FileInfo, Piece};

use super::{TorrentError, TorrentResult};
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// The information contained in a `.torrent` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    /// SHA-1 of the raw `info` value, byte-exact as it appeared on the wire.
    pub info_hash: [u8; 20],
    /// Flattened tracker URLs, in announce-list order.
    pub announce_list: Vec<String>,
    pub pieces: Vec<Piece>,
    pub files: Vec<FileInfo>,
    /// Root directory name; empty for single-file torrents.
    pub folder: String,
}

impl Metainfo {
    /// Parses a `.torrent` file.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Metainfo> {
        let root = bencode::decode(data)?;
        let dict = match &root {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Root is not a dictionary".to_string(),
                ))
            }
        };

        let announce_list = parse_announce_list(&root)?;

        let info = dict
            .get(&b"info"[..])
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let (folder, files) = parse_files(info)?;
        let pieces = parse_pieces(info, &files)?;

        // The hash covers the exact bytes of the `info` value, so it is
        // computed over the raw span rather than a re-encoding.
        let raw_info = bencode::raw_value(data, b"info")?;
        let info_hash = Sha1::digest(raw_info).into();

        Ok(Metainfo {
            info_hash,
            announce_list,
            pieces,
            files,
            folder,
        })
    }

    /// Total length of all files in the torrent.
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

fn required_str(dict: &BencodeValue, key: &[u8]) -> TorrentResult<Vec<u8>> {
    dict.get(key)
        .and_then(BencodeValue::as_str)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| TorrentError::MissingField(String::from_utf8_lossy(key).into_owned()))
}

fn required_int(dict: &BencodeValue, key: &[u8]) -> TorrentResult<u64> {
    let value = dict
        .get(key)
        .and_then(BencodeValue::as_int)
        .ok_or_else(|| TorrentError::MissingField(String::from_utf8_lossy(key).into_owned()))?;
    u64::try_from(value).map_err(|_| {
        TorrentError::InvalidFormat(format!("Negative {}", String::from_utf8_lossy(key)))
    })
}

fn utf8(bytes: Vec<u8>, what: &str) -> TorrentResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| TorrentError::InvalidFormat(format!("Invalid {} (not UTF-8): {}", what, e)))
}

/// Flattens the BEP 12 `announce-list` tiers; `announce` is consulted only
/// when `announce-list` is absent.
fn parse_announce_list(root: &BencodeValue) -> TorrentResult<Vec<String>> {
    let mut result = Vec::new();
    if let Some(tiers) = root.get(b"announce-list").and_then(BencodeValue::as_list) {
        for tier in tiers {
            let trackers = tier.as_list().ok_or_else(|| {
                TorrentError::InvalidFormat("Announce tier not a list".to_string())
            })?;
            for tracker in trackers {
                let raw = tracker.as_str().ok_or_else(|| {
                    TorrentError::InvalidFormat("Tracker URL not a string".to_string())
                })?;
                result.push(utf8(raw.to_vec(), "tracker URL")?);
            }
        }
    } else if let Some(raw) = root.get(b"announce").and_then(BencodeValue::as_str) {
        result.push(utf8(raw.to_vec(), "announce URL")?);
    }
    Ok(result)
}

/// Builds the file list with absolute offsets; returns the root folder name,
/// empty for single-file torrents.
fn parse_files(info: &BencodeValue) -> TorrentResult<(String, Vec<FileInfo>)> {
    let name = utf8(required_str(info, b"name")?, "name")?;

    if let Some(file_entries) = info.get(b"files").and_then(BencodeValue::as_list) {
        // Multiple file mode: `name` is the folder; paths are component
        // lists relative to it.
        let mut files = Vec::new();
        let mut begin = 0;
        for entry in file_entries {
            let length = required_int(entry, b"length")?;
            let components = entry
                .get(b"path")
                .and_then(BencodeValue::as_list)
                .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
            let mut path = PathBuf::new();
            for component in components {
                let raw = component.as_str().ok_or_else(|| {
                    TorrentError::InvalidFormat("File path component not a string".to_string())
                })?;
                path.push(utf8(raw.to_vec(), "file path component")?);
            }
            files.push(FileInfo {
                begin,
                length,
                path,
            });
            begin += length;
        }
        Ok((name, files))
    } else {
        // Single file mode.
        let length = required_int(info, b"length")?;
        let files = vec![FileInfo {
            begin: 0,
            length,
            path: PathBuf::from(&name),
        }];
        Ok((String::new(), files))
    }
}

/// Splits the concatenated 20-byte SHA-1 digests in `pieces` into [`Piece`]
/// records with absolute offsets; the last piece absorbs the remainder.
fn parse_pieces(info: &BencodeValue, files: &[FileInfo]) -> TorrentResult<Vec<Piece>> {
    let piece_length = required_int(info, b"piece length")?;
    if piece_length == 0 {
        return Err(TorrentError::InvalidFormat(
            "Zero piece length".to_string(),
        ));
    }
    let hashes = required_str(info, b"pieces")?;
    if hashes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }

    let total: u64 = files.iter().map(|f| f.length).sum();
    let mut pieces = Vec::with_capacity(hashes.len() / 20);
    let mut begin = 0;
    for (index, hash) in hashes.chunks_exact(20).enumerate() {
        let end = total.min(begin + piece_length);
        let mut digest = [0u8; 20];
        digest.copy_from_slice(hash);
        pieces.push(Piece {
            index: index as u32,
            begin,
            length: (end - begin) as u32,
            hash: digest,
        });
        begin = end;
    }
    Ok(pieces)
}
