//! # Download Coordination
//!
//! The [`Downloader`] turns a [`DownloadConfig`] into verified pieces:
//!
//! 1. **Queue**: Every piece of the torrent goes into a shared [`WorkQueue`]
//! 2. **Workers**: One [`Worker`] thread per peer pulls from the queue
//! 3. **Collect**: Verified pieces are handed to the caller, once per index,
//!    in whatever order they complete
//!
//! The download fails when a piece is abandoned after too many attempts, when
//! every worker has exited with pieces outstanding, or when no piece completes
//! within the stall timeout.
//!
//! Each run gets its own [`Shutdown`], so a downloader can be run again after
//! a run finished or was cancelled.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::config::{DownloadConfig, Settings};
use crate::error::DownloadError;
use crate::piece::{PieceResult, PieceWork};
use crate::queue::WorkQueue;
use crate::shutdown::Shutdown;
use crate::worker::{Event, Worker};

/// Downloads the pieces of one torrent from a fixed set of peers.
pub struct Downloader {
    /// What to download and from whom
    config: DownloadConfig,
    /// Timeouts and retry policy
    settings: Settings,
    /// Cancellation of the current run, or of the next one if none is running
    shutdown: Mutex<Arc<Shutdown>>,
}

impl Downloader {
    /// Builds a downloader after checking the configuration.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::NoPeers`] if the peer list is empty
    /// - [`DownloadError::InvalidConfig`] if the piece geometry is inconsistent
    pub fn new(config: DownloadConfig, settings: Settings) -> Result<Self, DownloadError> {
        config.validate()?;

        Ok(Downloader {
            config,
            settings,
            shutdown: Mutex::new(Arc::new(Shutdown::new())),
        })
    }

    /// Validated description of the download.
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Handle to cancel a download from another thread.
    ///
    /// The handle controls the running download, or the next one if none is
    /// running. Triggering it after the run it belongs to has returned has no
    /// effect on later runs.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        match self.shutdown.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Installs a fresh shutdown for the next run.
    fn renew_shutdown(&self) {
        let fresh = Arc::new(Shutdown::new());
        match self.shutdown.lock() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Downloads every piece, handing each verified piece to `on_piece`
    /// exactly once.
    ///
    /// Workers are told to stop when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Unrecoverable`] if a piece failed too many times
    /// - [`DownloadError::Stalled`] if no peer can deliver the remaining pieces
    /// - [`DownloadError::Cancelled`] if the shutdown handle was triggered
    /// - [`DownloadError::Sink`] if `on_piece` failed
    pub fn run<F>(&self, on_piece: F) -> Result<(), DownloadError>
    where
        F: FnMut(PieceResult) -> io::Result<()>,
    {
        // Take this run's shutdown before anything can trigger it
        let shutdown = self.shutdown_handle();

        let nb_pieces = self.config.nb_pieces();
        info!(
            "Downloading {:?} ({} pieces) from {} peers",
            self.config.name,
            nb_pieces,
            self.config.peers.len()
        );

        let pieces: Vec<PieceWork> = self
            .config
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let index = i as u32;
                PieceWork::new(index, *hash, self.config.piece_size(index))
            })
            .collect();

        // Fill the shared queue
        let queue = Arc::new(WorkQueue::new(pieces, self.settings.max_attempts));

        // One worker per peer
        let (events_tx, events_rx) = unbounded();
        for peer in &self.config.peers {
            Worker::new(
                peer.clone(),
                self.config.peer_id,
                self.config.info_hash,
                Arc::clone(&queue),
                events_tx.clone(),
                self.settings.clone(),
                Arc::clone(&shutdown),
            )
            .spawn();
        }
        drop(events_tx);

        let result = self.collect(&events_rx, &shutdown, on_piece);

        // Stop the workers still running
        queue.close();
        shutdown.trigger();
        self.renew_shutdown();

        result
    }

    /// Downloads the whole content into memory.
    pub fn download(&self) -> Result<Vec<u8>, DownloadError> {
        let mut data = vec![0; self.config.length as usize];

        self.run(|piece_result| {
            let begin = self.config.piece_offset(piece_result.index) as usize;
            data[begin..begin + piece_result.data.len()].copy_from_slice(&piece_result.data);
            Ok(())
        })?;

        Ok(data)
    }

    /// Gathers worker events until every piece was handed to `on_piece`.
    fn collect<F>(
        &self,
        events: &Receiver<Event>,
        shutdown: &Shutdown,
        mut on_piece: F,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(PieceResult) -> io::Result<()>,
    {
        let nb_pieces = self.config.nb_pieces();
        let mut received = vec![false; nb_pieces];
        let mut nb_received = 0;
        let mut nb_workers = self.config.peers.len();
        let mut last_progress = Instant::now();

        while nb_received < nb_pieces {
            if shutdown.is_triggered() {
                return Err(DownloadError::Cancelled);
            }

            let event = match events.recv_deadline(last_progress + self.settings.stall_timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(DownloadError::Stalled {
                        remaining: nb_pieces - nb_received,
                    });
                }
            };

            match event {
                Event::Completed(piece_result) => {
                    let index = piece_result.index as usize;
                    if received[index] {
                        warn!("Dropping duplicate result for piece {}", index);
                        continue;
                    }

                    received[index] = true;
                    nb_received += 1;
                    last_progress = Instant::now();
                    debug!("Collected piece {} ({}/{})", index, nb_received, nb_pieces);

                    on_piece(piece_result)?;
                }
                Event::Abandoned { index, attempts } => {
                    return Err(DownloadError::Unrecoverable { index, attempts });
                }
                Event::Exited { peer } => {
                    nb_workers -= 1;
                    debug!("Worker for peer #{} exited, {} left", peer, nb_workers);

                    if nb_workers == 0 {
                        if shutdown.is_triggered() {
                            return Err(DownloadError::Cancelled);
                        }
                        return Err(DownloadError::Stalled {
                            remaining: nb_pieces - nb_received,
                        });
                    }
                }
            }
        }

        info!("Downloaded all {} pieces", nb_pieces);

        Ok(())
    }
}
