//! # Download Configuration
//!
//! [`DownloadConfig`] describes what to download and from whom, as produced by
//! the torrent loader and the tracker. [`Settings`] holds the tunables of the
//! download engine itself.

use std::time::Duration;

use crate::error::DownloadError;
use crate::handshake::{InfoHash, PeerId};
use crate::peer::Peer;

/// Everything needed to download one torrent from a set of peers.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Peers to connect to, one worker each
    pub peers: Vec<Peer>,
    /// Our own 20-byte peer id
    pub peer_id: PeerId,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: InfoHash,
    /// Expected SHA-1 hash of each piece, in piece order
    pub piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// Total size of the content in bytes
    pub length: u64,
    /// Suggested name of the content
    pub name: String,
}

impl DownloadConfig {
    /// Checks that piece hashes, piece length and total length agree.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidConfig`] if the piece geometry is inconsistent
    /// - [`DownloadError::NoPeers`] if there is no peer to download from
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.piece_length == 0 {
            return Err(DownloadError::InvalidConfig(
                "piece length must not be zero".to_string(),
            ));
        }

        let expected = self.length.div_ceil(self.piece_length as u64);
        if expected != self.piece_hashes.len() as u64 {
            return Err(DownloadError::InvalidConfig(format!(
                "{} bytes in pieces of {} need {} hashes, got {}",
                self.length,
                self.piece_length,
                expected,
                self.piece_hashes.len()
            )));
        }

        if self.peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }

        Ok(())
    }

    /// Number of pieces in the torrent.
    pub fn nb_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte offset of piece `index` within the content.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Length of piece `index`; only the last piece may be shorter.
    pub fn piece_size(&self, index: u32) -> u32 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length as u64).min(self.length);

        end.saturating_sub(begin) as u32
    }
}

/// Tunables of the download engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Time allowed to open a TCP connection
    pub connect_timeout: Duration,
    /// Deadline for every blocking read or write on an established connection
    pub io_timeout: Duration,
    /// Failed attempts after which a piece is abandoned
    pub max_attempts: u32,
    /// Longest time the download may go without completing a piece
    pub stall_timeout: Duration,
    /// Pause taken by a worker whose peer has none of the pending pieces
    pub idle_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            connect_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(30),
            max_attempts: 10,
            stall_timeout: Duration::from_secs(300),
            idle_backoff: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config(length: u64, piece_length: u32, nb_hashes: usize) -> DownloadConfig {
        DownloadConfig {
            peers: vec![Peer::new(0, Ipv4Addr::LOCALHOST, 6881)],
            peer_id: [0; 20],
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]; nb_hashes],
            piece_length,
            length,
            name: "test".to_string(),
        }
    }

    #[test]
    fn last_piece_is_shorter() {
        let config = config(100, 32, 4);
        assert!(config.validate().is_ok());

        let sizes: Vec<u32> = (0..4).map(|i| config.piece_size(i)).collect();
        assert_eq!(sizes, vec![32, 32, 32, 4]);
        assert_eq!(config.piece_offset(3), 96);
    }

    #[test]
    fn exact_multiple_has_full_last_piece() {
        let config = config(64, 32, 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.piece_size(1), 32);
    }

    #[test]
    fn validate_rejects_inconsistent_hashes() {
        assert!(matches!(
            config(100, 32, 3).validate(),
            Err(DownloadError::InvalidConfig(_))
        ));
        assert!(matches!(
            config(100, 0, 4).validate(),
            Err(DownloadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_requires_peers() {
        let mut config = config(64, 32, 2);
        config.peers.clear();
        assert!(matches!(config.validate(), Err(DownloadError::NoPeers)));
    }
}
