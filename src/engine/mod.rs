//! The download engine root.
//!
//! The engine owns the shared piece-arbitration state, feeds tracker-found
//! peers into a bounded connection pool, and funnels verified pieces into
//! the file writer. Its normal termination is the missing set reaching
//! empty, which closes the verified-piece channel and lets the writer
//! finish.
use crate::peer::connection;
use crate::storage;
use crate::torrent::{chunks, Metainfo, Piece};
use crate::tracker;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

mod picker;
use picker::Picker;

/// Listening port reported to trackers; inbound connections are never
/// accepted.
pub const LISTEN_PORT: u16 = 6881;

#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the connection pool.
    pub max_peers: usize,
    /// In-flight block requests per connection.
    pub max_requests: usize,
    /// Scan existing files for valid pieces before downloading.
    pub resume: bool,
    /// Fixed RNG seed for the piece tie-break; random when absent.
    pub seed: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_peers: 50,
            max_requests: 10,
            resume: false,
            seed: None,
        }
    }
}

/// Shared state of one torrent download, handed to every peer connection.
pub(crate) struct Download {
    metainfo: Metainfo,
    base: PathBuf,
    peer_id: [u8; 20],
    max_requests: usize,
    shared: Mutex<Shared>,
}

struct Shared {
    picker: Picker,
    /// Cancel channels of the live connections, keyed by connection id.
    connections: HashMap<u64, mpsc::UnboundedSender<u32>>,
    /// Closed (dropped) once the missing set empties; the writer task ends
    /// when the channel drains.
    verified_tx: Option<mpsc::UnboundedSender<(u32, Vec<u8>)>>,
    next_connection: u64,
}

impl Download {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("engine state poisoned")
    }

    pub(crate) fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash
    }

    pub(crate) fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub(crate) fn num_pieces(&self) -> usize {
        self.metainfo.pieces.len()
    }

    pub(crate) fn piece(&self, index: u32) -> Piece {
        self.metainfo.pieces[index as usize].clone()
    }

    pub(crate) fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Picks a piece for a connection; see [`Picker::assign`].
    pub(crate) fn assign(&self, connection: u64, available: &HashSet<u32>) -> Option<u32> {
        self.shared().picker.assign(connection, available)
    }

    /// Accepts a verified piece from a connection.
    ///
    /// Duplicate deliveries are ignored; other borrowers of the piece are
    /// told to cancel it; the verified-piece channel closes when nothing is
    /// missing anymore.
    pub(crate) fn deliver(&self, connection: u64, piece: u32, data: Vec<u8>) {
        let mut shared = self.shared();
        let Some(others) = shared.picker.deliver(connection, piece) else {
            return;
        };
        for other in others {
            if let Some(cancel) = shared.connections.get(&other) {
                let _ = cancel.send(piece);
            }
        }
        if let Some(verified) = &shared.verified_tx {
            let _ = verified.send((piece, data));
        }
        if shared.picker.is_done() {
            shared.verified_tx = None;
        }
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<u32>) {
        let mut shared = self.shared();
        let connection = shared.next_connection;
        shared.next_connection += 1;
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        shared.connections.insert(connection, cancel_tx);
        shared.picker.add_peer(connection);
        (connection, cancel_rx)
    }

    fn deregister(&self, connection: u64) {
        let mut shared = self.shared();
        shared.connections.remove(&connection);
        shared.picker.drop_peer(connection);
    }

    fn connected_peers(&self) -> usize {
        self.shared().connections.len()
    }
}

/// Downloads the torrent, discovering peers from its trackers. Returns once
/// every piece is verified and on disk.
pub async fn download(metainfo: Metainfo, base: PathBuf, options: Options) -> anyhow::Result<()> {
    let peer_id = tracker::generate_peer_id();
    let params = tracker::AnnounceParams {
        info_hash: metainfo.info_hash,
        peer_id,
        port: LISTEN_PORT,
        uploaded: 0,
        downloaded: 0,
        left: metainfo.total_length(),
    };
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let trackers = tracker::spawn(metainfo.announce_list.clone(), params, peer_tx);
    let result = run(metainfo, base, options, peer_rx, peer_id).await;
    for task in trackers {
        task.abort();
    }
    result
}

/// Downloads the torrent from the peer addresses arriving on `peers`.
///
/// This is [`download`] without the tracker layer; tests feed the channel
/// directly.
pub async fn run(
    metainfo: Metainfo,
    base: PathBuf,
    options: Options,
    peers: mpsc::UnboundedReceiver<SocketAddr>,
    peer_id: [u8; 20],
) -> anyhow::Result<()> {
    let total = metainfo.pieces.len();
    let missing: HashSet<u32> = if options.resume {
        let missing = storage::scan(&metainfo, &base).context("scanning existing files")?;
        info!(
            present = total - missing.len(),
            total, "Resume scan finished"
        );
        missing
    } else {
        (0..total as u32).collect()
    };
    storage::allocate(&base, &metainfo.files).context("allocating files")?;
    if missing.is_empty() {
        println!("{}/{} pieces.", total, total);
        return Ok(());
    }

    let rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let done = total - missing.len();
    let (verified_tx, verified_rx) = mpsc::unbounded_channel();
    let download = Arc::new(Download {
        metainfo,
        base,
        peer_id,
        max_requests: options.max_requests,
        shared: Mutex::new(Shared {
            picker: Picker::new(missing, rng),
            connections: HashMap::new(),
            verified_tx: Some(verified_tx),
            next_connection: 0,
        }),
    });

    let writer = tokio::spawn(write_verified(download.clone(), verified_rx, done));
    let pool = tokio::spawn(connect_peers(download.clone(), options.max_peers, peers));

    let result = writer.await.context("file writer task")?;
    pool.abort();
    result
}

/// Gates peer connections on a fixed-size pool: acquire a slot, pull the
/// next fresh address, spawn a connection task that gives the slot back
/// when it ends.
///
/// The connection tasks live in a `JoinSet`, so cancelling the pool cancels
/// every connection with it and their sockets close on drop.
async fn connect_peers(
    download: Arc<Download>,
    max_peers: usize,
    mut peers: mpsc::UnboundedReceiver<SocketAddr>,
) {
    let slots = Arc::new(Semaphore::new(max_peers));
    let mut seen: HashSet<SocketAddr> = HashSet::new();
    let mut connections = tokio::task::JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}
        let Ok(permit) = slots.clone().acquire_owned().await else {
            return;
        };
        let addr = loop {
            match peers.recv().await {
                Some(addr) if seen.insert(addr) => break addr,
                // Already seen: every address gets one connection task.
                Some(_) => continue,
                None => {
                    // Every tracker is gone; let the live connections run on.
                    while connections.join_next().await.is_some() {}
                    return;
                }
            }
        };
        let download = download.clone();
        connections.spawn(async move {
            let (connection, cancel_rx) = download.register();
            debug!(%addr, connection, "Connecting to peer");
            if let Err(e) = connection::run(download.clone(), connection, addr, cancel_rx).await {
                debug!(%addr, connection, "Peer connection ended: {}", e);
            }
            download.deregister(connection);
            drop(permit);
        });
    }
}

/// Consumes the verified-piece channel, writing each piece to its files and
/// rewriting the progress line. Ends when the channel closes, which is the
/// engine's completion signal.
async fn write_verified(
    download: Arc<Download>,
    mut verified_rx: mpsc::UnboundedReceiver<(u32, Vec<u8>)>,
    mut done: usize,
) -> anyhow::Result<()> {
    let total = download.metainfo.pieces.len();
    let chunk_map = chunks(&download.metainfo.pieces, &download.metainfo.files);
    while let Some((index, data)) = verified_rx.recv().await {
        let base = download.base.clone();
        let files = download.metainfo.files.clone();
        let piece = download.piece(index);
        let piece_chunks = chunk_map[index as usize].clone();
        tokio::task::spawn_blocking(move || {
            storage::write_piece(&base, &files, &piece, &piece_chunks, &data)
        })
        .await
        .context("piece write task")?
        .with_context(|| format!("writing piece {}", index))?;
        done += 1;
        print!(
            "\r\x1b[K{}/{} pieces ({} peers)",
            done,
            total,
            download.connected_peers()
        );
        std::io::stdout().flush().ok();
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
    use crate::peer::message::{Bitfield, Message};
    use crate::peer::PeerError;
    use crate::torrent::BLOCK_LENGTH;
    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_metainfo(piece_data: &[&[u8]]) -> Metainfo {
        let mut pieces = Vec::new();
        let mut begin = 0;
        for (index, data) in piece_data.iter().enumerate() {
            pieces.push(Piece {
                index: index as u32,
                begin,
                length: data.len() as u32,
                hash: Sha1::digest(data).into(),
            });
            begin += data.len() as u64;
        }
        Metainfo {
            info_hash: [0xaa; 20],
            announce_list: Vec::new(),
            pieces,
            files: vec![crate::torrent::FileInfo {
                begin: 0,
                length: begin,
                path: "a".into(),
            }],
            folder: String::new(),
        }
    }

    fn test_download(metainfo: Metainfo) -> (Arc<Download>, mpsc::UnboundedReceiver<(u32, Vec<u8>)>) {
        let total = metainfo.pieces.len() as u32;
        let (verified_tx, verified_rx) = mpsc::unbounded_channel();
        let download = Arc::new(Download {
            metainfo,
            base: PathBuf::new(),
            peer_id: [0xbb; 20],
            max_requests: 10,
            shared: Mutex::new(Shared {
                picker: Picker::new((0..total).collect(), StdRng::seed_from_u64(0)),
                connections: HashMap::new(),
                verified_tx: Some(verified_tx),
                next_connection: 0,
            }),
        });
        (download, verified_rx)
    }

    async fn read_handshake(socket: &mut TcpStream) -> Handshake {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        socket.read_exact(&mut buf).await.unwrap();
        Handshake::from_bytes(&buf).unwrap()
    }

    async fn read_message(socket: &mut TcpStream) -> Message {
        let mut prefix = [0u8; 4];
        socket.read_exact(&mut prefix).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
        socket.read_exact(&mut payload).await.unwrap();
        Message::parse(&payload).unwrap()
    }

    async fn write_message(socket: &mut TcpStream, message: &Message) {
        socket.write_all(&message.to_bytes()).await.unwrap();
    }

    // Hash mismatch: the connection dies with InvalidData and the piece
    // goes back into circulation.
    #[tokio::test]
    async fn corrupt_piece_fails_connection_and_returns_piece() {
        let (download, _verified_rx) = test_download(test_metainfo(&[b"s"]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let theirs = read_handshake(&mut socket).await;
            let ours = Handshake::new(0, theirs.info_hash, [0xcc; 20]);
            socket.write_all(&ours.to_bytes()).await.unwrap();
            write_message(&mut socket, &Message::Bitfield(Bitfield::from_indices([0], 1))).await;
            assert_eq!(read_message(&mut socket).await, Message::Interested);
            write_message(&mut socket, &Message::Unchoke).await;
            assert_eq!(
                read_message(&mut socket).await,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 1
                }
            );
            write_message(
                &mut socket,
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    data: b"x".to_vec(),
                },
            )
            .await;
            // Hold the socket open; the client drops the connection.
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });

        let (connection, cancel_rx) = download.register();
        let result = connection::run(download.clone(), connection, addr, cancel_rx).await;
        assert!(matches!(result, Err(PeerError::InvalidData)));
        download.deregister(connection);

        // The piece is missing and unborrowed again.
        {
            let mut shared = download.shared();
            assert_eq!(shared.picker.missing_len(), 1);
            let available: HashSet<u32> = [0].into();
            shared.picker.add_peer(99);
            assert_eq!(shared.picker.assign(99, &available), Some(0));
        }
        peer.await.unwrap();
    }

    // Choke mid-piece: progress resets and the download restarts from
    // block 0 after the next unchoke.
    #[tokio::test]
    async fn choke_resets_progress() {
        let block = vec![7u8; BLOCK_LENGTH as usize];
        let tail = vec![9u8; 10];
        let mut piece_data = block.clone();
        piece_data.extend_from_slice(&tail);
        let (download, mut verified_rx) = test_download(test_metainfo(&[&piece_data]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let theirs = read_handshake(&mut socket).await;
            let ours = Handshake::new(0, theirs.info_hash, [0xcc; 20]);
            socket.write_all(&ours.to_bytes()).await.unwrap();
            write_message(&mut socket, &Message::Bitfield(Bitfield::from_indices([0], 1))).await;
            assert_eq!(read_message(&mut socket).await, Message::Interested);
            write_message(&mut socket, &Message::Unchoke).await;
            // Both blocks are requested, pipelined.
            assert_eq!(
                read_message(&mut socket).await,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: BLOCK_LENGTH
                }
            );
            assert_eq!(
                read_message(&mut socket).await,
                Message::Request {
                    index: 0,
                    begin: BLOCK_LENGTH,
                    length: 10
                }
            );
            // Choke before sending anything, then unchoke.
            write_message(&mut socket, &Message::Choke).await;
            write_message(&mut socket, &Message::Unchoke).await;
            // The client re-announces interest and re-requests from offset 0.
            assert_eq!(read_message(&mut socket).await, Message::Interested);
            assert_eq!(
                read_message(&mut socket).await,
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: BLOCK_LENGTH
                }
            );
            assert_eq!(
                read_message(&mut socket).await,
                Message::Request {
                    index: 0,
                    begin: BLOCK_LENGTH,
                    length: 10
                }
            );
            let (block, tail) = piece_data.split_at(BLOCK_LENGTH as usize);
            write_message(
                &mut socket,
                &Message::Piece {
                    index: 0,
                    begin: 0,
                    data: block.to_vec(),
                },
            )
            .await;
            write_message(
                &mut socket,
                &Message::Piece {
                    index: 0,
                    begin: BLOCK_LENGTH,
                    data: tail.to_vec(),
                },
            )
            .await;
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });

        let (connection, cancel_rx) = download.register();
        let client = tokio::spawn(connection::run(download.clone(), connection, addr, cancel_rx));

        let (index, data) = verified_rx.recv().await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(data.len(), BLOCK_LENGTH as usize + 10);
        assert!(download.shared().picker.is_done());

        client.abort();
        peer.await.unwrap();
    }
}
