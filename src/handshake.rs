//! # BitTorrent Handshake Protocol
//!
//! The first exchange on every peer connection. Both sides send:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19 for "BitTorrent protocol")
//! - **pstr**: Variable - Protocol identifier
//! - **reserved**: 8 bytes - Always zero on send, ignored on receive
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sender
//!
//! Parsing does not check that the info hash is the one we asked for, the
//! connection does that right after reading the response.

use std::io::Read;

use crate::error::PeerError;

pub const PROTOCOL_ID: &str = "BitTorrent protocol";

const RESERVED_LEN: usize = 8;

pub type InfoHash = [u8; 20];
pub type PeerId = [u8; 20];

/// A handshake message, as sent or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier ("BitTorrent protocol")
    pub pstr: String,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: InfoHash,
    /// 20-byte identifier of the sending peer
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a handshake for the standard BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.to_string(),
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into `49 + pstrlen` bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`PeerError::PayloadTooLarge`] if the protocol string does not
    /// fit in its one-byte length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>, PeerError> {
        let pstrlen = self.pstr.len();
        if pstrlen > u8::MAX as usize {
            return Err(PeerError::PayloadTooLarge(pstrlen));
        }

        let mut serialized = Vec::with_capacity(49 + pstrlen);
        serialized.push(pstrlen as u8);
        serialized.extend_from_slice(self.pstr.as_bytes());
        serialized.extend_from_slice(&[0; RESERVED_LEN]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        Ok(serialized)
    }
}

/// Reads one handshake from `reader`.
///
/// Consumes exactly `49 + pstrlen` bytes; the reserved bytes are discarded.
///
/// # Errors
///
/// - [`PeerError::TruncatedInput`] if the stream ends early
/// - [`PeerError::Io`] on any other read failure
pub fn deserialize_handshake<R: Read>(reader: &mut R) -> Result<Handshake, PeerError> {
    let mut pstrlen = [0; 1];
    reader.read_exact(&mut pstrlen)?;

    let mut pstr = vec![0; pstrlen[0] as usize];
    reader.read_exact(&mut pstr)?;

    let mut reserved = [0; RESERVED_LEN];
    reader.read_exact(&mut reserved)?;

    let mut info_hash = [0; 20];
    reader.read_exact(&mut info_hash)?;

    let mut peer_id = [0; 20];
    reader.read_exact(&mut peer_id)?;

    Ok(Handshake {
        pstr: String::from_utf8_lossy(&pstr).into_owned(),
        info_hash,
        peer_id,
    })
}
