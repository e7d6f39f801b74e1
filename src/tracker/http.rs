//! HTTP(S) tracker announces (BEP 3, compact peer lists per BEP 23).
use super::{Announce, AnnounceParams, TrackerError, TrackerResult};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Announces to an HTTP(S) tracker and parses its bencoded response.
#[tracing::instrument(skip(params), level = "debug")]
pub async fn announce(url: &Url, params: &AnnounceParams) -> TrackerResult<Announce> {
    // The info hash and peer id are raw bytes, percent-encoded directly;
    // query-pair builders would encode the percent signs a second time.
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&event=started&compact=1",
        percent_encode(&params.info_hash, NON_ALPHANUMERIC),
        percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    let mut target = url.clone();
    let full_query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, query),
        _ => query,
    };
    target.set_query(Some(&full_query));

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let response = client.get(target).send().await?;
    let body = response.bytes().await?;
    parse_response(&body)
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    peers: Peers,
}

/// The `peers` key is either a compact byte blob (BEP 23) or a list of
/// dictionaries (BEP 3).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(serde_bytes::ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

fn parse_response(body: &[u8]) -> TrackerResult<Announce> {
    let response: TrackerResponse = serde_bencode::from_bytes(body)?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    let peers = match response.peers {
        Peers::Compact(blob) => parse_compact_peers(&blob),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|peer| {
                peer.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, peer.port))
            })
            .collect(),
    };
    Ok(Announce {
        interval: response.interval,
        peers,
    })
}

/// Parses the 6-byte entries of a compact peer list: IPv4 address and port,
/// both big-endian.
pub(crate) fn parse_compact_peers(blob: &[u8]) -> Vec<SocketAddr> {
    blob.chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn parses_compact_response() {
        let body = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e";
        let announce = parse_response(body).unwrap();
        assert_eq!(announce.interval, 1800);
        assert_eq!(
            announce.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn parses_dictionary_response() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let announce = parse_response(body).unwrap();
        assert_eq!(announce.interval, 900);
        assert_eq!(announce.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let body = b"d14:failure reason12:unregisterede";
        assert!(matches!(
            parse_response(body),
            Err(TrackerError::Failure(reason)) if reason == "unregistered"
        ));
    }

    // A one-shot HTTP server that records the request line and serves a
    // fixed bencoded body.
    async fn serve_once(listener: TcpListener, body: &'static [u8]) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn announce_sends_raw_percent_encoded_hashes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            b"d8:intervali60e5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        ));

        let url = Url::parse(&format!("http://{}/announce", addr)).unwrap();
        let params = AnnounceParams {
            info_hash: [0xff; 20],
            peer_id: *b"-RP0300-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1,
        };
        let announce = announce(&url, &params).await.unwrap();
        assert_eq!(announce.interval, 60);
        assert_eq!(announce.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap().to_string();
        assert!(request_line.contains(&format!("info_hash={}", "%FF".repeat(20))));
        // NON_ALPHANUMERIC also encodes the dashes in the peer id.
        assert!(request_line.contains("peer_id=%2DRP0300%2Dabcdefghijkl"));
        assert!(request_line.contains("event=started"));
        assert!(request_line.contains("compact=1"));
        assert!(request_line.contains("left=1"));
    }
}
