//! Tracker clients for peer discovery.
//!
//! One task per tracker URL polls it in a loop: announce, emit the returned
//! peer addresses, sleep for the advertised interval. HTTP(S) trackers
//! follow BEP 3/23, UDP trackers BEP 15. Failures are isolated per tracker;
//! the download keeps running as long as any tracker yields peers.
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

pub mod http;
pub mod udp;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker returned failure: {0}")]
    Failure(String),

    #[error("Tracker retries exhausted")]
    RetriesExhausted,

    #[error("Unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid tracker URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid tracker response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Url parsing error: {0}")]
    Url(#[from] url::ParseError),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The announce parameters shared by the HTTP and UDP protocols.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A tracker's answer: how long to wait before the next announce, and the
/// peers it knows about.
#[derive(Debug, PartialEq, Eq)]
pub struct Announce {
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

/// Generates this client's peer id: an Azureus-style prefix followed by
/// random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RP0300-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Spawns one polling task per tracker URL, all emitting into `peers`.
pub fn spawn(
    announce_list: Vec<String>,
    params: AnnounceParams,
    peers: mpsc::UnboundedSender<SocketAddr>,
) -> Vec<JoinHandle<()>> {
    announce_list
        .into_iter()
        .map(|url| {
            let params = params.clone();
            let peers = peers.clone();
            tokio::spawn(async move {
                if let Err(e) = poll_tracker(&url, &params, &peers).await {
                    debug!(url, "Tracker failed: {}", e);
                }
            })
        })
        .collect()
}

async fn poll_tracker(
    url: &str,
    params: &AnnounceParams,
    peers: &mpsc::UnboundedSender<SocketAddr>,
) -> TrackerResult<()> {
    let parsed = Url::parse(url)?;
    loop {
        let announce = match parsed.scheme() {
            "http" | "https" => http::announce(&parsed, params).await?,
            "udp" => udp::announce(&parsed, params).await?,
            other => return Err(TrackerError::UnsupportedScheme(other.to_string())),
        };
        debug!(url, count = announce.peers.len(), "Tracker returned peers");
        for addr in announce.peers {
            if peers.send(addr).is_err() {
                // The engine hung up; nothing left to do.
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_secs(announce.interval)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_full_length() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RP0300-");
        assert_ne!(generate_peer_id()[8..], id[8..]);
    }
}
