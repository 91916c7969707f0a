//! # BitTorrent Peer Information
//!
//! Remote peers as handed out by a tracker, in the compact format:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian). A compact peer list is
//! a concatenation of such 6-byte entries.

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const PEER_SIZE: usize = 6;

/// Connection information for a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Sequential identifier used in logs
    pub id: u32,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    /// Creates a peer entry.
    ///
    /// # Arguments
    ///
    /// * `id` - Sequential identifier, only used in logs
    /// * `ip` - IPv4 address of the peer
    /// * `port` - Port the peer listens on
    ///
    pub fn new(id: u32, ip: Ipv4Addr, port: u16) -> Self {
        Peer { id, ip, port }
    }

    /// Address to connect to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}:{})", self.id, self.ip, self.port)
    }
}

/// Parses a compact peer list into peers numbered from 0.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn decode_peers(compact: &[u8]) -> Result<Vec<Peer>> {
    if compact.len() % PEER_SIZE != 0 {
        return Err(anyhow!(
            "malformed compact peer list: {} bytes is not a multiple of {}",
            compact.len(),
            PEER_SIZE
        ));
    }

    compact
        .chunks_exact(PEER_SIZE)
        .enumerate()
        .map(|(i, entry)| {
            // Get IP address and port
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = Cursor::new(&entry[4..]).read_u16::<BigEndian>()?;
            Ok(Peer::new(i as u32, ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_two_peers() {
        let compact = [192, 168, 1, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = decode_peers(&compact).unwrap();

        assert_eq!(
            peers,
            vec![
                Peer::new(0, Ipv4Addr::new(192, 168, 1, 1), 6881),
                Peer::new(1, Ipv4Addr::new(10, 0, 0, 2), 80),
            ]
        );
        assert_eq!(peers[0].socket_addr().to_string(), "192.168.1.1:6881");
    }

    #[test]
    fn decode_empty_list() {
        assert!(decode_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_partial_entry() {
        assert!(decode_peers(&[127, 0, 0, 1, 0]).is_err());
        assert!(decode_peers(&[0; 13]).is_err());
    }
}
