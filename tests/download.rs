//! End-to-end download against an in-process scripted peer.
use riptide::engine;
use riptide::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use riptide::peer::message::{Bitfield, Message};
use riptide::torrent::{FileInfo, Metainfo, Piece};

use sha1::{Digest, Sha1};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// A torrent with a single 1-byte piece in a single file named "a".
fn single_byte_metainfo() -> Metainfo {
    Metainfo {
        info_hash: [0xaa; 20],
        announce_list: Vec::new(),
        pieces: vec![Piece {
            index: 0,
            begin: 0,
            length: 1,
            hash: Sha1::digest(b"s").into(),
        }],
        files: vec![FileInfo {
            begin: 0,
            length: 1,
            path: "a".into(),
        }],
        folder: String::new(),
    }
}

async fn read_message(socket: &mut TcpStream) -> Message {
    let mut prefix = [0u8; 4];
    socket.read_exact(&mut prefix).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(prefix) as usize];
    socket.read_exact(&mut payload).await.unwrap();
    Message::parse(&payload).unwrap()
}

// The seeder side of the S1 conversation: handshake, bitfield, unchoke on
// interest, answer the single block request.
async fn serve_single_byte(mut socket: TcpStream) {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    socket.read_exact(&mut buf).await.unwrap();
    let theirs = Handshake::from_bytes(&buf).unwrap();
    assert_eq!(theirs.info_hash, [0xaa; 20]);
    let ours = Handshake::new(0, [0xaa; 20], [0x01; 20]);
    socket.write_all(&ours.to_bytes()).await.unwrap();

    let bitfield = Message::Bitfield(Bitfield::from_indices([0], 1));
    socket.write_all(&bitfield.to_bytes()).await.unwrap();
    assert_eq!(read_message(&mut socket).await, Message::Interested);
    socket.write_all(&Message::Unchoke.to_bytes()).await.unwrap();
    assert_eq!(
        read_message(&mut socket).await,
        Message::Request {
            index: 0,
            begin: 0,
            length: 1
        }
    );
    let piece = Message::Piece {
        index: 0,
        begin: 0,
        data: b"s".to_vec(),
    };
    socket.write_all(&piece.to_bytes()).await.unwrap();
    // Keep the connection open until the engine tears it down.
    let mut hold = [0u8; 1];
    let _ = socket.read(&mut hold).await;
}

#[tokio::test]
async fn downloads_single_piece_torrent_and_dedups_peers() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("download");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connections = Arc::new(AtomicU32::new(0));
    let connection_count = connections.clone();
    let seeder = tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            connection_count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_single_byte(socket));
        }
    });

    // The same address twice: exactly one connection task may come of it.
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    peer_tx.send(addr).unwrap();
    peer_tx.send(addr).unwrap();

    let options = engine::Options {
        seed: Some(7),
        ..engine::Options::default()
    };
    engine::run(single_byte_metainfo(), base.clone(), options, peer_rx, [0x02; 20])
        .await
        .unwrap();

    assert_eq!(std::fs::read(base.join("a")).unwrap(), b"s");
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    seeder.abort();
}

#[tokio::test]
async fn resume_skips_pieces_already_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("download");
    std::fs::create_dir_all(&base).unwrap();
    std::fs::write(base.join("a"), b"s").unwrap();

    // No peers at all: the resume scan alone must complete the download.
    let (_peer_tx, peer_rx) = mpsc::unbounded_channel();
    let options = engine::Options {
        resume: true,
        ..engine::Options::default()
    };
    engine::run(single_byte_metainfo(), base.clone(), options, peer_rx, [0x02; 20])
        .await
        .unwrap();
    assert_eq!(std::fs::read(base.join("a")).unwrap(), b"s");
}
