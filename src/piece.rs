//! # BitTorrent Piece Download
//!
//! Pieces are the verification units of a torrent. They are fetched in 16 KiB
//! blocks, with up to [`MAX_BACKLOG`] block requests in flight on a connection
//! at any time.
//!
//! ## Download Attempt
//!
//! 1. **Request**: While unchoked, top the pipeline up with requests for the
//!    next blocks
//! 2. **Receive**: Read one message; blocks are copied into the piece buffer,
//!    choke and availability updates are applied to the connection
//! 3. **Verify**: Once every byte arrived, compare the SHA-1 digest of the
//!    buffer with the expected hash
//!
//! A failed attempt drops its buffer; the caller decides whether to retry.

use sha1::{Digest, Sha1};

use crate::client::Client;
use crate::error::PeerError;
use crate::message::{parse_piece, Block, MessageId, MAX_BLOCK_LEN};

/// Maximum number of unanswered block requests per connection.
pub const MAX_BACKLOG: u32 = 5;

/// Size of a requested block (16 KiB).
pub const BLOCK_SIZE: u32 = MAX_BLOCK_LEN;

/// A piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece
    pub hash: [u8; 20],
    /// Length of the piece in bytes
    pub length: u32,
}

/// A downloaded piece that passed its integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Verified piece data
    pub data: Vec<u8>,
}

/// State of one attempt at downloading a piece.
///
/// Only blocks this attempt asked for are accepted. A block answering a
/// request of an earlier attempt, or arriving twice, is reported as not
/// applied and leaves the counters untouched.
#[derive(Debug)]
pub struct PieceProgress {
    /// Index of the piece being downloaded
    index: u32,
    /// Destination buffer, sized to the piece length
    buf: Vec<u8>,
    /// Bytes received and copied into `buf`
    downloaded: u32,
    /// Offset of the next block never requested
    requested: u32,
    /// Requests sent and not answered yet
    backlog: u32,
    /// `(begin, length)` of every request awaiting its block
    pending: Vec<(u32, u32)>,
    /// `(begin, length)` of requests dropped by a choke, to send again
    resend: Vec<(u32, u32)>,
}

impl PieceWork {
    /// Creates a work item for piece `index`.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index
    /// * `hash` - Expected SHA-1 hash of the piece
    /// * `length` - Piece length in bytes (the last piece may be shorter)
    ///
    pub fn new(index: u32, hash: [u8; 20], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceProgress {
    /// Starts an attempt at `work` with an empty buffer and nothing requested.
    pub fn new(work: &PieceWork) -> Self {
        PieceProgress {
            index: work.index,
            buf: vec![0; work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
            pending: Vec::new(),
            resend: Vec::new(),
        }
    }

    /// Bytes received so far.
    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    /// Requests sent and not answered yet.
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Returns `true` once every byte of the piece arrived.
    pub fn is_complete(&self) -> bool {
        self.downloaded as usize >= self.buf.len()
    }

    /// Returns the next block to request as `(begin, length)`.
    ///
    /// Blocks dropped by a choke come first, then the first block never
    /// requested. Returns `None` when the pipeline is full or nothing is
    /// left to ask for.
    pub fn next_request(&self) -> Option<(u32, u32)> {
        if self.backlog >= MAX_BACKLOG {
            return None;
        }

        if let Some(&request) = self.resend.first() {
            return Some(request);
        }

        let length = self.buf.len() as u32;
        if self.requested >= length {
            return None;
        }

        Some((self.requested, BLOCK_SIZE.min(length - self.requested)))
    }

    /// Records that a request for `length` bytes at `begin` went out.
    pub fn requested(&mut self, begin: u32, length: u32) {
        match self.resend.iter().position(|&r| r == (begin, length)) {
            Some(pos) => {
                self.resend.remove(pos);
            }
            None => self.requested = self.requested.max(begin.saturating_add(length)),
        }

        self.pending.push((begin, length));
        self.backlog += 1;
    }

    /// Forgets every pending request so that they are sent again.
    ///
    /// A peer drops our pending requests when it chokes us.
    pub fn reset_requests(&mut self) {
        self.resend.append(&mut self.pending);
        self.resend.sort_unstable();
        self.backlog = 0;
    }

    /// Checks whether `block` answers a request of this attempt.
    pub fn is_pending(&self, block: &Block<'_>) -> bool {
        block.index == self.index
            && self
                .pending
                .iter()
                .any(|&(begin, length)| begin == block.begin && length as usize == block.data.len())
    }

    /// Copies a received block into the piece buffer.
    ///
    /// Returns `Ok(false)` without touching the buffer if the block fits but
    /// was not asked for by this attempt.
    ///
    /// # Errors
    ///
    /// - [`PeerError::IndexMismatch`] if the block belongs to another piece
    /// - [`PeerError::Bounds`] if the block does not fit in the buffer
    ///
    /// The buffer is left untouched on error.
    pub fn apply_block(&mut self, block: &Block<'_>) -> Result<bool, PeerError> {
        if block.index != self.index {
            return Err(PeerError::IndexMismatch {
                expected: self.index,
                received: block.index,
            });
        }

        let begin = block.begin as usize;
        let end = match begin.checked_add(block.data.len()) {
            Some(end) if end <= self.buf.len() => end,
            _ => {
                return Err(PeerError::Bounds {
                    begin: block.begin,
                    len: block.data.len(),
                    capacity: self.buf.len(),
                })
            }
        };

        // Late or duplicate block
        if !self.is_pending(block) {
            return Ok(false);
        }
        self.pending
            .retain(|&(begin, length)| begin != block.begin || length as usize != block.data.len());

        self.buf[begin..end].copy_from_slice(block.data);
        self.downloaded += block.data.len() as u32;
        self.backlog = self.backlog.saturating_sub(1);

        Ok(true)
    }

    /// Checks the assembled buffer against `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Integrity`] on mismatch; the data is dropped.
    pub fn verify(self, hash: &[u8; 20]) -> Result<PieceResult, PeerError> {
        let digest = Sha1::digest(&self.buf);
        if digest.as_slice() != hash {
            return Err(PeerError::Integrity(self.index));
        }

        Ok(PieceResult {
            index: self.index,
            data: self.buf,
        })
    }
}

/// Downloads and verifies one piece over `client`.
///
/// The caller should have checked that the peer has the piece.
///
/// Blocks answering requests of an earlier attempt on the same connection
/// are skipped, so a failed attempt does not spill over into the next one.
///
/// # Arguments
///
/// * `client` - Session with a peer that has the piece
/// * `work` - Piece to download
///
/// # Returns
///
/// The verified piece.
///
/// # Errors
///
/// - [`PeerError::PieceUnavailable`] if the peer does not have the piece
/// - [`PeerError::IndexMismatch`] or [`PeerError::Bounds`] on an unsolicited bad block
/// - [`PeerError::Integrity`] if the assembled piece does not match its hash
/// - any read or write failure on the connection
pub fn download_piece(client: &mut Client, work: &PieceWork) -> Result<PieceResult, PeerError> {
    if !client.has_piece(work.index) {
        return Err(PeerError::PieceUnavailable(work.index));
    }

    let mut progress = PieceProgress::new(work);

    while !progress.is_complete() {
        // Top the pipeline up while the peer accepts requests
        if !client.is_choked() {
            while let Some((begin, length)) = progress.next_request() {
                client.send_request(work.index, begin, length)?;
                progress.requested(begin, length);
            }
        }

        // Keep-alives carry nothing
        let message = match client.read_message()? {
            Some(message) => message,
            None => continue,
        };

        match message.id {
            // Our pending requests are gone, ask again after the unchoke
            MessageId::Choke => progress.reset_requests(),
            MessageId::Piece => {
                let block = parse_piece(&message)?;
                let solicited = client.settle_request(block.index, block.begin, block.data.len());

                // Answer to a request this attempt no longer waits for
                if solicited && !progress.is_pending(&block) {
                    debug!(
                        "Skipping stale block of piece {} [{}:+{}] from peer {}",
                        block.index,
                        block.begin,
                        block.data.len(),
                        client.peer()
                    );
                    continue;
                }

                if !progress.apply_block(&block)? {
                    debug!(
                        "Skipping duplicate block of piece {} [{}:+{}] from peer {}",
                        block.index,
                        block.begin,
                        block.data.len(),
                        client.peer()
                    );
                }
            }
            _ => {}
        }
    }

    let result = progress.verify(&work.hash)?;

    info!(
        "Downloaded piece {} ({} bytes) from peer {}",
        work.index,
        work.length,
        client.peer()
    );

    Ok(result)
}
