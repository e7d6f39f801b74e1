//! Command-line entry point: download a torrent, or fetch a `.torrent`
//! file from peers given a magnet URI.
use anyhow::Context;
use clap::{Parser, Subcommand};
use riptide::engine;
use riptide::magnet;
use riptide::torrent::Metainfo;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "riptide", version, about = "Download files from the BitTorrent network.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the contents of a .torrent file.
    Download {
        /// Path to the torrent file.
        torrent: PathBuf,
        /// Scan existing files for valid pieces before downloading.
        #[arg(long)]
        resume: bool,
        /// Write verbose logs to debug.log.
        #[arg(long)]
        debug: bool,
    },
    /// Fetch a .torrent file from peers, given a magnet URI.
    FetchMetadata {
        /// The magnet URI to use.
        uri: String,
        /// Number of peers to connect to.
        #[arg(long, default_value_t = 50)]
        peers: usize,
        /// Write verbose logs to debug.log.
        #[arg(long)]
        debug: bool,
    },
}

fn init_tracing(debug: bool) -> anyhow::Result<()> {
    if debug {
        let file = fs::File::create("debug.log").context("creating debug.log")?;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("riptide=debug"))
            .with_writer(std::sync::Arc::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riptide=warn")),
            )
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Download {
            torrent,
            resume,
            debug,
        } => {
            init_tracing(debug)?;
            let raw = fs::read(&torrent)
                .with_context(|| format!("reading {}", torrent.display()))?;
            let metainfo = Metainfo::from_bytes(&raw).context("parsing torrent file")?;
            let base = Path::new("download").join(&metainfo.folder);
            println!("Downloading {} to {}.", torrent.display(), base.display());
            let options = engine::Options {
                resume,
                ..engine::Options::default()
            };
            tokio::select! {
                result = engine::download(metainfo, base, options) => result?,
                _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
            }
            println!("Done.");
        }
        Command::FetchMetadata { uri, peers, debug } => {
            init_tracing(debug)?;
            let (info_hash, announce_list) =
                magnet::parse(&uri).context("parsing magnet URI")?;
            let raw = tokio::select! {
                result = magnet::fetch_metadata(info_hash, &announce_list, peers) => result?,
                _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
            };
            let path = format!("{}.torrent", hex::encode(info_hash));
            fs::write(&path, raw).with_context(|| format!("writing {}", path))?;
            println!("Wrote {}.", path);
        }
    }
    Ok(())
}
