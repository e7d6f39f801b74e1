//! UDP tracker announces (BEP 15).
//!
//! The protocol is two request/response pairs over one socket: `connect`
//! yields a 64-bit connection id, `announce` spends it. Datagrams get lost,
//! so every send is retried with an exponentially growing timeout of
//! `15 * 2^n` seconds; a connection id older than 60 seconds is stale and
//! forces a fresh connect.
use super::{Announce, AnnounceParams, TrackerError, TrackerResult};
use crate::tracker::http::parse_compact_peers;

use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::trace;

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Attempt `n` waits `15 * 2^n` seconds; nine failed attempts give up.
const MAX_ATTEMPTS: u32 = 9;

/// Connection ids are valid for one minute after the connect response.
const CONNECTION_ID_EXPIRY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) enum Request<'a> {
    Connect {
        transaction_id: u32,
    },
    Announce {
        connection_id: u64,
        transaction_id: u32,
        key: u32,
        params: &'a AnnounceParams,
    },
}

impl Request<'_> {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Connect { transaction_id } => {
                buf.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
                buf.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
            }
            Request::Announce {
                connection_id,
                transaction_id,
                key,
                params,
            } => {
                buf.extend_from_slice(&connection_id.to_be_bytes());
                buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                buf.extend_from_slice(&transaction_id.to_be_bytes());
                buf.extend_from_slice(&params.info_hash);
                buf.extend_from_slice(&params.peer_id);
                buf.extend_from_slice(&params.downloaded.to_be_bytes());
                buf.extend_from_slice(&params.left.to_be_bytes());
                buf.extend_from_slice(&params.uploaded.to_be_bytes());
                // event: 0 (none).
                buf.extend_from_slice(&0u32.to_be_bytes());
                // IP address: 0 (use the sender's).
                buf.extend_from_slice(&0u32.to_be_bytes());
                buf.extend_from_slice(&key.to_be_bytes());
                // num_want: -1 (tracker's choice).
                buf.extend_from_slice(&(-1i32).to_be_bytes());
                buf.extend_from_slice(&params.port.to_be_bytes());
            }
        }
        buf
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    Connect {
        transaction_id: u32,
        connection_id: u64,
    },
    Announce {
        transaction_id: u32,
        interval: u32,
        peers: Vec<SocketAddr>,
    },
    Error {
        transaction_id: u32,
        message: String,
    },
}

impl Response {
    pub(crate) fn transaction_id(&self) -> u32 {
        match self {
            Response::Connect { transaction_id, .. }
            | Response::Announce { transaction_id, .. }
            | Response::Error { transaction_id, .. } => *transaction_id,
        }
    }

    pub(crate) fn parse(data: &[u8]) -> TrackerResult<Response> {
        let mut cursor = Cursor::new(data);
        let action = cursor.read_u32::<BigEndian>()?;
        let transaction_id = cursor.read_u32::<BigEndian>()?;
        match action {
            ACTION_CONNECT => Ok(Response::Connect {
                transaction_id,
                connection_id: cursor.read_u64::<BigEndian>()?,
            }),
            ACTION_ANNOUNCE => {
                let interval = cursor.read_u32::<BigEndian>()?;
                let _leechers = cursor.read_u32::<BigEndian>()?;
                let _seeders = cursor.read_u32::<BigEndian>()?;
                let mut rest = Vec::new();
                cursor.read_to_end(&mut rest)?;
                Ok(Response::Announce {
                    transaction_id,
                    interval,
                    peers: parse_compact_peers(&rest),
                })
            }
            ACTION_ERROR => {
                let mut rest = Vec::new();
                cursor.read_to_end(&mut rest)?;
                Ok(Response::Error {
                    transaction_id,
                    message: String::from_utf8_lossy(&rest).into_owned(),
                })
            }
            other => Err(TrackerError::InvalidResponse(format!(
                "Unknown action: {}",
                other
            ))),
        }
    }
}

/// Announces to a UDP tracker, connecting first.
#[tracing::instrument(skip(params), level = "debug")]
pub async fn announce(url: &url::Url, params: &AnnounceParams) -> TrackerResult<Announce> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::InvalidUrl("Missing host".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TrackerError::InvalidUrl("Missing port".to_string()))?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;

    let mut connection: Option<(u64, Instant)> = None;
    for attempt in 0..MAX_ATTEMPTS {
        let timeout = Duration::from_secs(15 * (1 << attempt));

        if connection
            .as_ref()
            .is_some_and(|(_, received)| received.elapsed() >= CONNECTION_ID_EXPIRY)
        {
            // Stale mid-retry; start over from connect.
            connection = None;
        }
        if connection.is_none() {
            let transaction_id = rand::rng().random();
            socket
                .send(&Request::Connect { transaction_id }.to_bytes())
                .await?;
            trace!(attempt, "Sent connect request");
            match read_matching(&socket, transaction_id, Instant::now() + timeout).await? {
                Some(Response::Connect { connection_id, .. }) => {
                    connection = Some((connection_id, Instant::now()));
                }
                Some(Response::Error { message, .. }) => {
                    return Err(TrackerError::Failure(message));
                }
                _ => continue,
            }
        }
        let Some((connection_id, _)) = connection else {
            continue;
        };

        let transaction_id = rand::rng().random();
        let request = Request::Announce {
            connection_id,
            transaction_id,
            key: rand::rng().random(),
            params,
        };
        socket.send(&request.to_bytes()).await?;
        trace!(attempt, "Sent announce request");
        match read_matching(&socket, transaction_id, Instant::now() + timeout).await? {
            Some(Response::Announce {
                interval, peers, ..
            }) => {
                return Ok(Announce {
                    interval: interval as u64,
                    peers,
                });
            }
            Some(Response::Error { message, .. }) => return Err(TrackerError::Failure(message)),
            _ => continue,
        }
    }
    Err(TrackerError::RetriesExhausted)
}

/// Reads datagrams until one parses with the expected transaction id, or the
/// deadline passes (`None`). Unparseable and mismatched datagrams are
/// dropped.
async fn read_matching(
    socket: &UdpSocket,
    transaction_id: u32,
    deadline: Instant,
) -> TrackerResult<Option<Response>> {
    let mut buf = [0u8; 2048];
    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(None),
        };
        match Response::parse(&buf[..received]) {
            Ok(response) if response.transaction_id() == transaction_id => {
                return Ok(Some(response));
            }
            Ok(_) => trace!("Dropping response with stale transaction id"),
            Err(e) => trace!("Dropping malformed datagram: {}", e),
        }
    }
}
