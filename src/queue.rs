//! Shared queue of pieces waiting for a worker.
//!
//! Workers pop pieces, and push them back when their peer lacks the piece or
//! the attempt failed. Failed attempts are counted per piece so that a piece
//! nobody can deliver is eventually given up on. Closing the queue wakes every
//! blocked worker.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::piece::PieceWork;

/// Pieces waiting for a worker, shared by every worker of a download.
///
/// Pieces come out in the order they went in. A piece handed back goes to
/// the end of the queue.
pub struct WorkQueue {
    /// Pending pieces
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Dropping the sender disconnects the receiver, which closes the queue
    close_chan: (Mutex<Option<Sender<()>>>, Receiver<()>),
    /// Failed attempts per piece index
    failures: Mutex<HashMap<u32, u32>>,
    /// Failed attempts after which a piece is abandoned
    max_attempts: u32,
}

/// What happened to a piece handed back after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Requeued {
    /// Back in the queue
    Retry,
    /// Too many failed attempts, dropped from the queue
    Abandoned { attempts: u32 },
}

impl WorkQueue {
    /// Creates an open queue holding `pieces`.
    ///
    /// # Arguments
    ///
    /// * `pieces` - Pieces to download, in the order they should be tried
    /// * `max_attempts` - Failed attempts after which a piece is abandoned
    ///
    pub fn new(pieces: Vec<PieceWork>, max_attempts: u32) -> Self {
        let (work_tx, work_rx) = unbounded();
        for piece in pieces {
            // Both ends are alive, sending cannot fail
            let _ = work_tx.send(piece);
        }
        let (close_tx, close_rx) = unbounded();

        WorkQueue {
            work_chan: (work_tx, work_rx),
            close_chan: (Mutex::new(Some(close_tx)), close_rx),
            failures: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Blocks until a piece is available.
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<PieceWork> {
        if self.is_closed() {
            return None;
        }

        select! {
            recv(self.work_chan.1) -> piece => piece.ok(),
            recv(self.close_chan.1) -> _ => None,
        }
    }

    /// Hands back a piece the worker could not try.
    pub fn push_back(&self, piece: PieceWork) {
        if self.work_chan.0.send(piece).is_err() {
            error!("Error: could not send piece to work queue");
        }
    }

    /// Hands back a piece after a failed attempt.
    ///
    /// # Returns
    ///
    /// [`Requeued::Abandoned`] once the piece reached `max_attempts` failures;
    /// the piece is then dropped instead of queued again.
    pub fn requeue(&self, piece: PieceWork) -> Requeued {
        // Count this failure
        let attempts = {
            let mut failures = match self.failures.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let attempts = failures.entry(piece.index).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempts >= self.max_attempts {
            return Requeued::Abandoned { attempts };
        }

        self.push_back(piece);
        Requeued::Retry
    }

    /// Number of pieces currently waiting.
    pub fn len(&self) -> usize {
        self.work_chan.1.len()
    }

    /// Returns `true` if no piece is waiting.
    pub fn is_empty(&self) -> bool {
        self.work_chan.1.is_empty()
    }

    /// Closes the queue.
    ///
    /// Every worker blocked in [`WorkQueue::pop`] wakes up with `None`, and
    /// later pops return `None` right away.
    pub fn close(&self) {
        let mut close_tx = match self.close_chan.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        close_tx.take();
    }

    /// Returns `true` once [`WorkQueue::close`] was called.
    pub fn is_closed(&self) -> bool {
        match self.close_chan.0.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}
