//! Magnet URIs and the metadata exchange protocol (BEP 9).
//!
//! A magnet URI carries only an info hash and tracker URLs; the `.torrent`
//! body itself is fetched from peers over the extension protocol. The
//! `ut_metadata` sub-protocol ships the raw `info` dictionary in 16 KiB
//! pieces; stop-and-wait is enough because the metadata is small.
use crate::bencode::{self, BencodeValue};
use crate::peer::handshake::{Handshake, EXTENSION_PROTOCOL};
use crate::peer::message::{
    ExtensionHandshake, ExtensionMessage, Message, MetadataMessage, LOCAL_UT_METADATA,
};
use crate::peer::{PeerError, PeerResult, PeerStream};
use crate::tracker::{self, AnnounceParams};

use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

/// Metadata is exchanged in pieces of this size; the last one is shorter.
const METADATA_PIECE_LENGTH: u64 = 1 << 14;

/// Per-message read timeout during the exchange.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Refuse to fetch absurd metadata sizes; real info dictionaries are well
/// under a mebibyte.
const MAX_METADATA_SIZE: u64 = 1 << 26;

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("Invalid magnet URI: {0}")]
    InvalidUri(String),

    #[error("Url parsing error: {0}")]
    Url(#[from] url::ParseError),
}

/// Parses a magnet URI into its info hash and tracker list.
pub fn parse(uri: &str) -> Result<([u8; 20], Vec<String>), MagnetError> {
    let url = Url::parse(uri)?;
    if url.scheme() != "magnet" {
        return Err(MagnetError::InvalidUri("Wrong scheme".to_string()));
    }
    let mut info_hash = None;
    let mut announce_list = Vec::new();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                let digest = value.strip_prefix("urn:btih:").ok_or_else(|| {
                    MagnetError::InvalidUri("Invalid value for 'xt'".to_string())
                })?;
                let raw = hex::decode(digest)
                    .map_err(|_| MagnetError::InvalidUri("Invalid info hash".to_string()))?;
                info_hash = Some(<[u8; 20]>::try_from(raw.as_slice()).map_err(|_| {
                    MagnetError::InvalidUri("Invalid info hash length".to_string())
                })?);
            }
            "tr" => announce_list.push(value.into_owned()),
            _ => {}
        }
    }
    let info_hash =
        info_hash.ok_or_else(|| MagnetError::InvalidUri("Missing key 'xt'".to_string()))?;
    Ok((info_hash, announce_list))
}

/// Fetches the `.torrent` body for `info_hash` from the swarm.
///
/// Candidate peers come from the trackers; up to `max_peers` exchanges run
/// concurrently and the first verified result wins.
pub async fn fetch_metadata(
    info_hash: [u8; 20],
    announce_list: &[String],
    max_peers: usize,
) -> anyhow::Result<Vec<u8>> {
    let peer_id = tracker::generate_peer_id();
    let params = AnnounceParams {
        info_hash,
        peer_id,
        port: crate::engine::LISTEN_PORT,
        uploaded: 0,
        downloaded: 0,
        // Announced before the torrent's size is known.
        left: 0,
    };
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let trackers = tracker::spawn(announce_list.to_vec(), params, peer_tx);
    let raw_info = fetch_from_swarm(info_hash, peer_id, peer_rx, max_peers).await;
    for task in trackers {
        task.abort();
    }
    Ok(assemble_metadata(announce_list, &raw_info?))
}

async fn fetch_from_swarm(
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    mut peers: mpsc::UnboundedReceiver<SocketAddr>,
    max_peers: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut seen: HashSet<SocketAddr> = HashSet::new();
    let mut exchanges = JoinSet::new();
    loop {
        tokio::select! {
            Some(addr) = peers.recv(), if exchanges.len() < max_peers => {
                if seen.insert(addr) {
                    exchanges.spawn(fetch_from_peer(addr, info_hash, peer_id));
                }
            }
            Some(joined) = exchanges.join_next() => {
                match joined {
                    Ok(Ok(raw_info)) => return Ok(raw_info),
                    Ok(Err(e)) => debug!("Metadata exchange failed: {}", e),
                    Err(e) => debug!("Metadata exchange panicked: {}", e),
                }
            }
            else => anyhow::bail!("Ran out of peers before fetching the metadata"),
        }
    }
}

/// One linear exchange with one peer: handshake with the extension bit,
/// swap extension handshakes, then request the metadata pieces one at a
/// time and verify the reassembled bytes against the info hash.
async fn fetch_from_peer(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> PeerResult<Vec<u8>> {
    let mut stream = read_timely(PeerStream::connect(addr)).await??;
    let ours = Handshake::new(EXTENSION_PROTOCOL, info_hash, peer_id);
    let theirs = read_timely(stream.handshake(&ours)).await??;
    if !theirs.supports_extensions() {
        return Err(PeerError::Protocol(
            "Peer does not support the extension protocol".to_string(),
        ));
    }
    if theirs.info_hash != info_hash {
        return Err(PeerError::Protocol(
            "Info hash mismatch in handshake".to_string(),
        ));
    }

    stream
        .write(&Message::Extension(ExtensionMessage::Handshake(
            ExtensionHandshake {
                ut_metadata: LOCAL_UT_METADATA,
                metadata_size: None,
            },
        )))
        .await?;
    let (ut_metadata, metadata_size) = loop {
        if let Message::Extension(ExtensionMessage::Handshake(handshake)) =
            read_timely(stream.read()).await??
        {
            let size = handshake.metadata_size.ok_or_else(|| {
                PeerError::Protocol("Peer does not know the metadata size".to_string())
            })?;
            break (handshake.ut_metadata, size);
        }
    };
    if metadata_size == 0 || metadata_size > MAX_METADATA_SIZE {
        return Err(PeerError::Protocol(format!(
            "Implausible metadata size: {}",
            metadata_size
        )));
    }

    let mut raw_info = Vec::new();
    for index in 0..metadata_size.div_ceil(METADATA_PIECE_LENGTH) {
        stream
            .write(&Message::Extension(ExtensionMessage::Metadata {
                id: ut_metadata,
                message: MetadataMessage::Request {
                    piece: index as u32,
                },
            }))
            .await?;
        loop {
            match read_timely(stream.read()).await?? {
                Message::Extension(ExtensionMessage::Metadata {
                    message: MetadataMessage::Data { data, .. },
                    ..
                }) => {
                    raw_info.extend_from_slice(&data);
                    break;
                }
                Message::Extension(ExtensionMessage::Metadata {
                    message: MetadataMessage::Reject { .. },
                    ..
                }) => {
                    return Err(PeerError::Protocol(
                        "Peer rejected a metadata request".to_string(),
                    ));
                }
                _ => {}
            }
        }
    }

    if <[u8; 20]>::from(Sha1::digest(&raw_info)) != info_hash {
        return Err(PeerError::InvalidData);
    }
    Ok(raw_info)
}

async fn read_timely<F: std::future::Future>(future: F) -> PeerResult<F::Output> {
    timeout(METADATA_TIMEOUT, future)
        .await
        .map_err(|_| PeerError::RequestTimeout)
}

/// Assembles a `.torrent` body around the raw `info` bytes.
///
/// The `info` value must be spliced in verbatim: re-encoding could reorder
/// or renormalize it and change the info hash.
fn assemble_metadata(announce_list: &[String], raw_info: &[u8]) -> Vec<u8> {
    let tiers = BencodeValue::List(vec![BencodeValue::List(
        announce_list
            .iter()
            .map(|url| BencodeValue::String(url.as_bytes().to_vec()))
            .collect(),
    )]);
    let mut result = Vec::new();
    result.extend_from_slice(b"d");
    result.extend_from_slice(b"13:announce-list");
    result.extend_from_slice(&bencode::encode_to_bytes(&tiers));
    result.extend_from_slice(b"4:info");
    result.extend_from_slice(raw_info);
    result.extend_from_slice(b"e");
    result
}
