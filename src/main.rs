//! # Xerus Wire
//!
//! Downloads a single-file torrent from the peers its trackers announce.
//!
//! ## Usage
//!
//! ```bash
//! xerus-wire <torrent_file>
//! xerus-wire <torrent_file> -o <output_file> --force
//! RUST_LOG=xerus_wire=debug xerus-wire <torrent_file>
//! ```
//!
//! ## Flow
//!
//! 1. **Metadata**: Load the torrent and compute its info hash
//! 2. **Tracker**: Announce to get a list of peers
//! 3. **Download**: One worker thread per peer, pieces written to the output
//!    file at their offset as soon as they are verified

#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;

use xerus_wire::handshake::PeerId;
use xerus_wire::{tracker, Downloader, Settings, Torrent};

/// Port announced to trackers
const PORT: u16 = 6881;

/// Azureus-style client prefix of our peer id
const PEER_ID_PREFIX: &[u8; 8] = b"-XW0300-";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Downloads a torrent over the BitTorrent peer wire protocol."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Overwrite the output file without asking
    #[arg(long)]
    force: bool,

    /// Seconds to wait on a silent peer before dropping it
    #[arg(long, default_value_t = 30)]
    read_timeout: u64,

    /// Failed attempts after which a piece is given up on
    #[arg(long, default_value_t = 10)]
    max_attempts: u32,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Random peer id with our client prefix.
fn generate_peer_id() -> PeerId {
    let mut peer_id = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

/// Asks before overwriting an existing file.
fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", path.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn run(args: Args) -> Result<()> {
    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    let torrent = Torrent::open(&args.torrent)?;

    let output_filepath = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    if output_filepath.exists() && !args.force && !confirm_overwrite(&output_filepath)? {
        println!("Download cancelled.");
        return Ok(());
    }

    let peer_id = generate_peer_id();
    let peers = tracker::request_peers(&torrent, &peer_id, PORT)?;

    let settings = Settings {
        io_timeout: Duration::from_secs(args.read_timeout),
        max_attempts: args.max_attempts,
        ..Settings::default()
    };
    let downloader = Downloader::new(torrent.download_config(peer_id, peers), settings)?;

    let mut output_file = File::create(&output_filepath).with_context(|| {
        format!(
            "could not create output file '{}'",
            output_filepath.display()
        )
    })?;
    output_file.set_len(torrent.length())?;

    println!(
        "Downloading {:?} ({} pieces)",
        torrent.name(),
        torrent.nb_pieces()
    );

    let pb = ProgressBar::new(torrent.length());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );

    let config = downloader.config();
    downloader.run(|piece_result| {
        output_file.seek(SeekFrom::Start(config.piece_offset(piece_result.index)))?;
        output_file.write_all(&piece_result.data)?;
        pb.inc(piece_result.data.len() as u64);
        Ok(())
    })?;

    pb.finish();
    output_file.flush()?;
    info!("Download of {:?} complete", torrent.name());

    println!("Saved in \"{}\".", output_filepath.display());

    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("  "), "download");
        assert_eq!(sanitize_filename(".."), "download");
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
    }

    #[test]
    fn peer_id_has_client_prefix() {
        let a = generate_peer_id();
        let b = generate_peer_id();

        assert_eq!(&a[..8], b"-XW0300-");
        assert_ne!(a, b);
    }
}
