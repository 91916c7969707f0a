//! # Tracker Announce
//!
//! Asks HTTP trackers for peers. Tiers are tried in order, and the trackers of
//! a tier are queried in parallel. The first tier that yields any peer wins.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::handshake::{InfoHash, PeerId};
use crate::peer::{decode_peers, Peer};
use crate::torrent::Torrent;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct BencodeTracker {
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    peers: ByteBuf,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

/// Requests peers for `torrent` from its trackers.
///
/// # Arguments
///
/// * `peer_id` - 20-byte unique ID of this client.
/// * `port` - Port number the client claims to listen on.
///
pub fn request_peers(torrent: &Torrent, peer_id: &PeerId, port: u16) -> Result<Vec<Peer>> {
    for (i, tier) in torrent.tiers().iter().enumerate() {
        let urls: Vec<String> = tier
            .iter()
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
            .cloned()
            .collect();

        if urls.is_empty() {
            debug!("Skipping tracker tier {}: no HTTP tracker", i);
            continue;
        }

        let peers = announce_tier(urls, torrent.info_hash(), peer_id, port, torrent.length());
        if !peers.is_empty() {
            info!("Got {} peers from tracker tier {}", peers.len(), i);
            return Ok(peers);
        }
    }

    Err(anyhow!("could not get peers from any tracker"))
}

/// Queries every tracker of a tier in parallel and merges their peers.
fn announce_tier(
    urls: Vec<String>,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Vec<Peer> {
    let all_peers = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for tracker_url in urls {
        let info_hash = *info_hash;
        let peer_id = *peer_id;
        let all_peers = Arc::clone(&all_peers);

        handles.push(thread::spawn(move || {
            match announce(&tracker_url, &info_hash, &peer_id, port, left) {
                Ok(mut peers) => {
                    debug!("Tracker {} returned {} peers", tracker_url, peers.len());
                    match all_peers.lock() {
                        Ok(mut guard) => guard.append(&mut peers),
                        Err(poisoned) => poisoned.into_inner().append(&mut peers),
                    }
                }
                Err(e) => warn!("Tracker {} failed: {:#}", tracker_url, e),
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    let peers = match all_peers.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    dedup_peers(peers)
}

/// Sends a single announce and decodes the compact peer list.
fn announce(
    announce: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<Peer>> {
    let url = build_tracker_url(announce, info_hash, peer_id, port, left)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
        .context("could not build HTTP client")?;

    let body = client
        .get(&url)
        .send()
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .context("tracker request failed")?;

    parse_response(&body)
}

/// Decodes a bencoded tracker response.
fn parse_response(body: &[u8]) -> Result<Vec<Peer>> {
    let response: BencodeTracker =
        de::from_bytes(body).context("could not decode tracker response")?;

    if let Some(reason) = response.failure_reason {
        return Err(anyhow!("tracker refused announce: {}", reason));
    }

    debug!("Tracker asks to announce again in {}s", response.interval);
    decode_peers(&response.peers)
}

/// Drops peers seen twice and renumbers the rest.
fn dedup_peers(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Peer> = peers
        .into_iter()
        .filter(|peer| seen.insert((peer.ip, peer.port)))
        .collect();

    for (i, peer) in unique.iter_mut().enumerate() {
        peer.id = i as u32;
    }
    unique
}

/// Builds the announce URL.
///
/// The query is written by hand: `info_hash` and `peer_id` are raw bytes and
/// must be percent-encoded byte by byte.
fn build_tracker_url(
    announce: &str,
    info_hash: &InfoHash,
    peer_id: &PeerId,
    port: u16,
    left: u64,
) -> Result<String> {
    let base_url =
        Url::parse(announce).with_context(|| format!("could not parse tracker url '{}'", announce))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    url.push(if base_url.query().is_some() { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Each byte is encoded as %XX
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}
