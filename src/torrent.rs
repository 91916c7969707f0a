//! # Torrent Metadata
//!
//! Loads a single-file `.torrent`:
//!
//! - **announce** / **announce-list**: Tracker URLs, grouped in tiers
//! - **info**: File name, sizes and the concatenated SHA-1 hashes of the pieces
//!
//! The info hash is the SHA-1 of the bencoded `info` dictionary. The dictionary
//! is kept as a raw value and re-encoded so that keys this loader does not
//! know about still count towards the hash.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::config::DownloadConfig;
use crate::handshake::{InfoHash, PeerId};
use crate::peer::Peer;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Metadata of a single-file torrent.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker tiers, each shuffled
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: InfoHash,
    /// Expected SHA-1 hash of each piece
    piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
    /// Suggested filename
    name: String,
}

#[derive(Deserialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Missing in multi-file torrents
    #[serde(default)]
    length: Option<u64>,
    name: String,
}

#[derive(Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    info: Value,
}

impl Torrent {
    /// Reads and parses a `.torrent` file.
    pub fn open(path: &Path) -> Result<Torrent> {
        let buf = fs::read(path)
            .with_context(|| format!("could not read torrent '{}'", path.display()))?;
        Torrent::from_bytes(&buf)
    }

    /// Parses bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        // Decode the raw info dictionary, then its fields
        let bencode: BencodeTorrent = de::from_bytes(buf).context("could not decode torrent")?;

        let info_bytes = ser::to_bytes(&bencode.info).context("could not encode info")?;
        let info: BencodeInfo =
            de::from_bytes(&info_bytes).context("could not decode torrent info")?;

        let length = info
            .length
            .ok_or_else(|| anyhow!("multi-file torrents are not supported"))?;

        if info.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!(
                "torrent is invalid: {} bytes of piece hashes",
                info.pieces.len()
            ));
        }
        let piece_hashes = info
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0; SHA1_HASH_SIZE];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // Shuffle each tier as per BEP 12
        let mut tiers = if !bencode.announce_list.is_empty() {
            bencode.announce_list
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        };
        let mut rng = rand::thread_rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }

        // Hash the info dictionary exactly as it was encoded
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&Sha1::digest(&info_bytes));

        Ok(Torrent {
            tiers,
            info_hash,
            piece_hashes,
            piece_length: info.piece_length,
            length,
            name: info.name,
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of the content in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn nb_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Describes the download of this torrent from `peers`.
    pub fn download_config(&self, peer_id: PeerId, peers: Vec<Peer>) -> DownloadConfig {
        DownloadConfig {
            peers,
            peer_id,
            info_hash: self.info_hash,
            piece_hashes: self.piece_hashes.clone(),
            piece_length: self.piece_length,
            length: self.length,
            name: self.name.clone(),
        }
    }
}
