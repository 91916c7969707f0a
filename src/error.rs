//! # Errors
//!
//! Error types for the peer wire protocol and the download coordinator.
//!
//! [`PeerError`] covers everything that can go wrong on a single connection,
//! from codec failures to a piece failing its integrity check. Whether an error
//! ends the connection or only the current piece attempt is decided by
//! [`PeerError::is_piece_local`].
//!
//! [`DownloadError`] covers the download as a whole.

use std::io;

use thiserror::Error;

use crate::message::MessageId;

/// Errors raised while talking to a single peer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The handshake could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] Box<PeerError>),

    /// The peer answered for a different torrent.
    #[error("info hash mismatch: expected {}, received {}", hex(expected), hex(received))]
    HandshakeMismatch {
        expected: [u8; 20],
        received: [u8; 20],
    },

    #[error("truncated input")]
    TruncatedInput,

    /// Outgoing payload exceeds the protocol maximum.
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),

    /// Incoming frame announces a length above the protocol maximum.
    #[error("message of {0} bytes is too large")]
    MessageTooLarge(u32),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("expected {expected:?} message, received {received:?}")]
    UnexpectedMessageType {
        expected: MessageId,
        received: MessageId,
    },

    #[error("malformed {id:?} payload of {len} bytes")]
    MalformedPayload { id: MessageId, len: usize },

    #[error("piece index {0} is out of range")]
    IndexOutOfRange(u32),

    #[error("peer does not have piece {0}")]
    PieceUnavailable(u32),

    /// A block arrived for a piece other than the one in progress.
    #[error("expected block for piece {expected}, received piece {received}")]
    IndexMismatch { expected: u32, received: u32 },

    /// A block does not fit in the destination buffer.
    #[error("block [{begin}:+{len}] overflows piece buffer of {capacity} bytes")]
    Bounds {
        begin: u32,
        len: usize,
        capacity: usize,
    },

    #[error("piece {0} failed integrity check")]
    Integrity(u32),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl PeerError {
    /// Returns `true` when the error only invalidates the current piece attempt
    /// and the connection can keep serving other pieces.
    pub fn is_piece_local(&self) -> bool {
        matches!(
            self,
            PeerError::Integrity(_) | PeerError::IndexMismatch { .. } | PeerError::Bounds { .. }
        )
    }

    /// Wraps any error raised during the handshake phase.
    ///
    /// An info hash mismatch is kept as is so callers can tell it apart.
    pub(crate) fn into_handshake(self) -> PeerError {
        match self {
            err @ (PeerError::HandshakeMismatch { .. } | PeerError::Handshake(_)) => err,
            other => PeerError::Handshake(Box::new(other)),
        }
    }
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => PeerError::TruncatedInput,
            _ => PeerError::Io(err),
        }
    }
}

/// Errors that end a whole download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid download configuration: {0}")]
    InvalidConfig(String),

    #[error("no peers to download from")]
    NoPeers,

    /// No worker can make progress on the remaining pieces.
    #[error("download stalled with {remaining} pieces remaining")]
    Stalled { remaining: usize },

    /// A piece kept failing and was given up on.
    #[error("piece {index} abandoned after {attempts} failed attempts")]
    Unrecoverable { index: u32, attempts: u32 },

    #[error("download cancelled")]
    Cancelled,

    /// The consumer of verified pieces failed.
    #[error("could not store piece: {0}")]
    Sink(#[from] io::Error),
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
