//! # BitTorrent Worker Thread
//!
//! One worker per peer, each on its own thread. A worker owns its peer's
//! [`Client`] exclusively and only talks to the rest of the download through
//! the shared [`WorkQueue`] and its event channel.
//!
//! ## Worker Loop
//!
//! 1. **Connect**: Handshake with the peer, or give up on it for good
//! 2. **Pick**: Pop a piece; hand it straight back if the peer lacks it
//! 3. **Download**: Fetch and verify the piece, announce it with HAVE
//! 4. **Report**: Send the verified piece to the coordinator
//!
//! ## Error Handling
//!
//! - Handshake failure: the worker exits, the peer is not retried
//! - Bad block or failed integrity check: the piece is requeued, the peer
//!   keeps working on other pieces
//! - Any other connection error: the piece is requeued and the worker exits

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;

use crate::client::Client;
use crate::config::Settings;
use crate::handshake::{InfoHash, PeerId};
use crate::peer::Peer;
use crate::piece::{download_piece, PieceResult};
use crate::queue::{Requeued, WorkQueue};
use crate::shutdown::Shutdown;

/// What workers report to the coordinator.
#[derive(Debug)]
pub enum Event {
    /// A piece was downloaded and verified
    Completed(PieceResult),
    /// A piece failed too many times and left the queue
    Abandoned { index: u32, attempts: u32 },
    /// The worker stopped
    Exited { peer: u32 },
}

/// Downloads pieces from a single peer.
pub struct Worker {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: PeerId,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: InfoHash,
    /// Pieces waiting to be downloaded, shared by all workers
    queue: Arc<WorkQueue>,
    /// Channel to the coordinator
    events: Sender<Event>,
    settings: Settings,
    shutdown: Arc<Shutdown>,
}

impl Worker {
    /// Creates a worker for `peer`. Nothing happens until it is spawned.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer to download from
    /// * `peer_id` - 20-byte unique ID of this client
    /// * `info_hash` - Torrent to download
    /// * `queue` - Pieces shared with the other workers
    /// * `events` - Channel to the coordinator
    /// * `settings` - Timeouts and idle backoff
    /// * `shutdown` - Cancellation of the download
    ///
    pub fn new(
        peer: Peer,
        peer_id: PeerId,
        info_hash: InfoHash,
        queue: Arc<WorkQueue>,
        events: Sender<Event>,
        settings: Settings,
        shutdown: Arc<Shutdown>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            queue,
            events,
            settings,
            shutdown,
        }
    }

    /// Runs the worker on a new thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            self.start_download();
            let _ = self.events.send(Event::Exited { peer: self.peer.id });
        })
    }

    /// Connects to the peer and downloads pieces until the queue closes or
    /// the connection fails.
    pub fn start_download(&self) {
        let mut client =
            match Client::connect(&self.peer, self.peer_id, self.info_hash, &self.settings) {
                Ok(client) => client,
                Err(e) => {
                    info!("Could not connect to peer {}: {}", self.peer, e);
                    return;
                }
            };

        info!("Completed handshake with peer {}", self.peer);

        // Unregistered when the worker returns
        let _registration = match self.shutdown.register(client.stream()) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Could not track connection to peer {}: {}", self.peer, e);
                return;
            }
        };

        // Pieces handed back in a row because the peer lacks them
        let mut skipped = 0;

        while !self.shutdown.is_triggered() {
            // Get the next piece
            let piece_work = match self.queue.pop() {
                Some(piece_work) => piece_work,
                None => {
                    debug!("Worker for peer {} exiting: work queue closed", self.peer);
                    return;
                }
            };

            if !client.has_piece(piece_work.index) {
                self.queue.push_back(piece_work);
                skipped += 1;

                // A whole pass over the queue without anything this peer has
                if skipped > self.queue.len() {
                    thread::sleep(self.settings.idle_backoff);
                    skipped = 0;
                }
                continue;
            }
            skipped = 0;

            // Download and verify it
            let index = piece_work.index;
            match download_piece(&mut client, &piece_work) {
                Ok(piece_result) => {
                    let have = client.send_have(index);

                    if self.events.send(Event::Completed(piece_result)).is_err() {
                        error!("Error: could not send piece {} to coordinator", index);
                        return;
                    }

                    if let Err(e) = have {
                        info!("Could not announce piece {} to peer {}: {}", index, self.peer, e);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Piece {} failed with peer {}: {}", index, self.peer, e);

                    if let Requeued::Abandoned { attempts } = self.queue.requeue(piece_work) {
                        warn!("Giving up on piece {} after {} attempts", index, attempts);
                        let _ = self.events.send(Event::Abandoned { index, attempts });
                    }

                    if !e.is_piece_local() {
                        info!("Disconnecting from peer {}", self.peer);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::PieceWork;
    use crate::testing::*;
    use crossbeam_channel::unbounded;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn worker(peer: Peer, queue: Arc<WorkQueue>, events: Sender<Event>) -> Worker {
        worker_with_shutdown(peer, queue, events, Arc::new(Shutdown::new()))
    }

    fn worker_with_shutdown(
        peer: Peer,
        queue: Arc<WorkQueue>,
        events: Sender<Event>,
        shutdown: Arc<Shutdown>,
    ) -> Worker {
        let settings = Settings {
            io_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(10),
            ..Settings::default()
        };
        Worker::new(
            peer,
            [1; 20],
            INFO_HASH,
            queue,
            events,
            settings,
            shutdown,
        )
    }

    fn works(pieces: &[Vec<u8>]) -> Vec<PieceWork> {
        pieces
            .iter()
            .enumerate()
            .map(|(i, p)| PieceWork::new(i as u32, sha1(p), p.len() as u32))
            .collect()
    }

    #[test]
    fn unreachable_peer_exits_immediately() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let queue = Arc::new(WorkQueue::new(vec![], 3));
        let (events_tx, events_rx) = unbounded();

        worker(Peer::new(7, Ipv4Addr::LOCALHOST, port), queue, events_tx)
            .spawn()
            .join()
            .unwrap();

        assert!(matches!(events_rx.recv().unwrap(), Event::Exited { peer: 7 }));
    }

    #[test]
    fn downloads_every_piece_then_exits_on_close() {
        let pieces = split_pieces(&content(5000), 1024);
        let addr = FakeSeeder::new(pieces.clone()).spawn();
        let queue = Arc::new(WorkQueue::new(works(&pieces), 3));
        let (events_tx, events_rx) = unbounded();

        let handle = worker(local_peer(0, addr), Arc::clone(&queue), events_tx).spawn();

        let mut received = vec![None; pieces.len()];
        for _ in 0..pieces.len() {
            match events_rx.recv().unwrap() {
                Event::Completed(result) => received[result.index as usize] = Some(result.data),
                other => panic!("unexpected event {:?}", other),
            }
        }
        queue.close();
        handle.join().unwrap();

        let received: Vec<Vec<u8>> = received.into_iter().map(Option::unwrap).collect();
        assert_eq!(received, pieces);
        assert!(matches!(events_rx.recv().unwrap(), Event::Exited { .. }));
    }

    #[test]
    fn corrupt_peer_keeps_connection_until_abandoned() {
        let pieces = split_pieces(&content(100), 100);
        let mut seeder = FakeSeeder::new(pieces.clone());
        seeder.corrupt = true;
        let served = Arc::clone(&seeder.served);
        let addr = seeder.spawn();
        let queue = Arc::new(WorkQueue::new(works(&pieces), 3));
        let (events_tx, events_rx) = unbounded();

        let handle = worker(local_peer(0, addr), Arc::clone(&queue), events_tx).spawn();

        assert!(matches!(
            events_rx.recv().unwrap(),
            Event::Abandoned {
                index: 0,
                attempts: 3
            }
        ));
        // Every attempt went over the same connection
        assert_eq!(served.load(Ordering::SeqCst), 3);
        queue.close();
        handle.join().unwrap();
    }

    #[test]
    fn exited_worker_unregisters_its_stream() {
        let pieces = split_pieces(&content(2048), 1024);
        let addr = FakeSeeder::new(pieces.clone()).spawn();
        let queue = Arc::new(WorkQueue::new(works(&pieces), 3));
        let shutdown = Arc::new(Shutdown::new());
        let (events_tx, events_rx) = unbounded();

        let handle = worker_with_shutdown(
            local_peer(0, addr),
            Arc::clone(&queue),
            events_tx,
            Arc::clone(&shutdown),
        )
        .spawn();

        for _ in 0..pieces.len() {
            assert!(matches!(events_rx.recv().unwrap(), Event::Completed(_)));
        }
        assert_eq!(shutdown.registered(), 1);

        queue.close();
        handle.join().unwrap();
        assert_eq!(shutdown.registered(), 0);
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn dropped_connection_requeues_piece() {
        let pieces = split_pieces(&content(40000), 40000);
        let mut seeder = FakeSeeder::new(pieces.clone());
        seeder.drop_after_blocks = Some(1);
        let addr = seeder.spawn();
        let queue = Arc::new(WorkQueue::new(works(&pieces), 3));
        let (events_tx, events_rx) = unbounded();

        worker(local_peer(0, addr), Arc::clone(&queue), events_tx)
            .spawn()
            .join()
            .unwrap();

        assert!(matches!(events_rx.recv().unwrap(), Event::Exited { .. }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().index, 0);
    }
}
