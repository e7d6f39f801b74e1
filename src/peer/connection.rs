//! The per-peer download state machine.
//!
//! One task per TCP connection. After the handshake the machine moves
//! through `Choked -> Interested -> Unchoked`, falling back to `Choked`
//! whenever the peer chokes and parking in `Passive` when the engine has
//! nothing left to assign. Block requests are pipelined up to an in-flight
//! cap to hide round-trip latency; every outstanding request carries a
//! deadline, and a deadline passing kills the connection.
use crate::engine::Download;
use crate::torrent::{blocks, valid_piece_data, Block, Piece};

use super::handshake::Handshake;
use super::message::Message;
use super::stream::PeerStream;
use super::{PeerError, PeerResult};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Time allowed for a requested block to arrive.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state once the handshake is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The peer will not answer requests; we have not asked to be unchoked.
    Choked,
    /// We sent `Interested` and are waiting for an unchoke.
    Interested,
    /// The peer answers requests.
    Unchoked,
    /// The engine has no piece left to assign; woken by `Have`.
    Passive,
}

/// A single piece's assembly buffer.
struct Progress {
    piece: Piece,
    data: Vec<u8>,
    missing: HashSet<Block>,
}

impl Progress {
    fn new(piece: Piece) -> Self {
        let data = vec![0u8; piece.length as usize];
        let missing = blocks(&piece).into_iter().collect();
        Self {
            piece,
            data,
            missing,
        }
    }

    fn add(&mut self, block: &Block, data: &[u8]) {
        self.missing.remove(block);
        let begin = block.begin as usize;
        self.data[begin..begin + data.len()].copy_from_slice(data);
    }

    fn done(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Per-peer download queue: pending blocks, in-flight requests with their
/// deadlines, and piece assembly buffers.
#[derive(Default)]
struct DownloadQueue {
    stack: Vec<Block>,
    requested: HashMap<Block, Instant>,
    progress: HashMap<u32, Progress>,
}

impl DownloadQueue {
    /// Queues every block of `piece` for download.
    fn add_piece(&mut self, piece: Piece) {
        let blocks = blocks(&piece);
        self.progress.insert(piece.index, Progress::new(piece));
        // The stack pops from the back; reversing makes the first block the
        // next request.
        self.stack.extend(blocks.into_iter().rev());
    }

    fn in_flight(&self) -> usize {
        self.requested.len()
    }

    /// Pops the next pending block, marking it in flight until `timeout`
    /// from now.
    fn next_block(&mut self, timeout: Duration) -> Option<Block> {
        let block = self.stack.pop()?;
        self.requested.insert(block, Instant::now() + timeout);
        Some(block)
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.requested.values().min().copied()
    }

    /// Drops all in-flight and queued blocks and restarts every piece in
    /// progress from scratch. Used on choke: the pieces stay assigned to
    /// this connection, but any partially assembled data is discarded.
    fn reset(&mut self) {
        self.stack.clear();
        self.requested.clear();
        let pieces: Vec<Piece> = self
            .progress
            .drain()
            .map(|(_, progress)| progress.piece)
            .collect();
        for piece in pieces {
            self.add_piece(piece);
        }
    }

    /// Forgets `piece` entirely; a block of it that is already on the wire
    /// will be dropped on arrival.
    fn cancel_piece(&mut self, index: u32) {
        self.stack.retain(|block| block.piece != index);
        self.requested.retain(|block, _| block.piece != index);
        self.progress.remove(&index);
    }

    /// Accepts a downloaded block.
    ///
    /// Returns the piece and its verified data if this block completes it.
    /// Blocks that were never requested (or were cancelled) are dropped
    /// silently.
    fn put_block(&mut self, block: Block, data: &[u8]) -> PeerResult<Option<(u32, Vec<u8>)>> {
        if self.requested.remove(&block).is_none() {
            return Ok(None);
        }
        let Some(progress) = self.progress.get_mut(&block.piece) else {
            return Ok(None);
        };
        progress.add(&block, data);
        if !progress.done() {
            return Ok(None);
        }
        let progress = match self.progress.remove(&block.piece) {
            Some(progress) => progress,
            None => return Ok(None),
        };
        if valid_piece_data(&progress.piece, &progress.data) {
            Ok(Some((progress.piece.index, progress.data)))
        } else {
            Err(PeerError::InvalidData)
        }
    }
}

/// Runs the connection until it fails or the engine cancels the task.
///
/// `cancel_rx` carries piece indices the engine wants this connection to
/// stop downloading because another peer delivered them first.
pub(crate) async fn run(
    download: Arc<Download>,
    connection: u64,
    addr: SocketAddr,
    mut cancel_rx: mpsc::UnboundedReceiver<u32>,
) -> PeerResult<()> {
    let mut stream = PeerStream::connect(addr).await?;
    let ours = Handshake::new(0, download.info_hash(), download.peer_id());
    let theirs = stream.handshake(&ours).await?;
    if theirs.info_hash != download.info_hash() {
        return Err(PeerError::Protocol(
            "Info hash mismatch in handshake".to_string(),
        ));
    }

    let total = download.num_pieces();
    let mut available: HashSet<u32> = HashSet::new();

    // Wait for the peer to say which pieces it has. The bitfield is not
    // mandated, but a first `have` works just as well.
    loop {
        match stream.read().await? {
            Message::Bitfield(bitfield) => {
                available.extend(
                    bitfield
                        .to_indices()
                        .into_iter()
                        .filter(|&index| (index as usize) < total),
                );
                break;
            }
            Message::Have { index } if (index as usize) < total => {
                available.insert(index);
                break;
            }
            _ => {}
        }
    }

    let max_requests = download.max_requests();
    let mut state = State::Choked;
    let mut queue = DownloadQueue::default();

    loop {
        match state {
            State::Choked => {
                stream.write(&Message::Interested).await?;
                state = State::Interested;
            }
            State::Unchoked if queue.in_flight() < max_requests => {
                if let Some(block) = queue.next_block(REQUEST_TIMEOUT) {
                    trace!(connection, ?block, "Requesting block");
                    stream
                        .write(&Message::Request {
                            index: block.piece,
                            begin: block.begin,
                            length: block.length,
                        })
                        .await?;
                } else if let Some(index) = download.assign(connection, &available) {
                    queue.add_piece(download.piece(index));
                } else {
                    state = State::Passive;
                }
            }
            _ => {
                let message = tokio::select! {
                    result = stream.read() => result?,
                    Some(index) = cancel_rx.recv() => {
                        queue.cancel_piece(index);
                        continue;
                    }
                    _ = wait_until(queue.earliest_deadline()) => {
                        return Err(PeerError::RequestTimeout);
                    }
                };
                match message {
                    Message::Choke => {
                        queue.reset();
                        state = State::Choked;
                    }
                    Message::Unchoke => {
                        if state != State::Passive {
                            state = State::Unchoked;
                        }
                    }
                    Message::Have { index } => {
                        // An out-of-range index drops the message only.
                        if (index as usize) < total {
                            available.insert(index);
                            if state == State::Passive {
                                state = State::Unchoked;
                            }
                        }
                    }
                    Message::Piece { index, begin, data } => {
                        let block = Block {
                            piece: index,
                            begin,
                            length: data.len() as u32,
                        };
                        if let Some((piece, data)) = queue.put_block(block, &data)? {
                            download.deliver(connection, piece, data);
                        }
                    }
                    // Everything else is tolerated: keep-alives, duplicate
                    // bitfields, messages only a seeder would act on, and
                    // extension traffic we didn't ask for.
                    _ => {}
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
