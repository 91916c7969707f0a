//! Cooperative shutdown of peer workers.
//!
//! Workers register a clone of their connection's stream and hold the
//! returned [`Registration`] for as long as the connection lives. Triggering
//! the handle shuts every registered stream down, so a worker blocked in a
//! read wakes up with an error and exits. Dropping a registration forgets its
//! stream.

use std::io;
use std::net::{Shutdown as SocketShutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Cancellation signal shared by a download and its workers.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    /// Id of the next registration
    next_id: AtomicU64,
    /// Registered streams by registration id
    streams: Mutex<Vec<(u64, TcpStream)>>,
}

/// Keeps a stream registered with a [`Shutdown`] until dropped.
#[derive(Debug)]
#[must_use = "the stream is forgotten as soon as the registration is dropped"]
pub struct Registration {
    shutdown: Arc<Shutdown>,
    /// `None` when the stream was closed on registration
    id: Option<u64>,
}

impl Shutdown {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns `true` once [`Shutdown::trigger`] was called.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Tracks `stream` so that [`Shutdown::trigger`] can close it.
    ///
    /// A stream registered after the trigger is closed right away.
    ///
    /// # Returns
    ///
    /// A guard that unregisters the stream when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be cloned.
    pub fn register(self: &Arc<Self>, stream: &TcpStream) -> io::Result<Registration> {
        let clone = stream.try_clone()?;

        let mut streams = self.streams();
        if self.is_triggered() {
            let _ = clone.shutdown(SocketShutdown::Both);
            return Ok(Registration {
                shutdown: Arc::clone(self),
                id: None,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        streams.push((id, clone));

        Ok(Registration {
            shutdown: Arc::clone(self),
            id: Some(id),
        })
    }

    /// Number of streams currently registered.
    pub fn registered(&self) -> usize {
        self.streams().len()
    }

    /// Signals every worker to stop and closes all registered streams.
    pub fn trigger(&self) {
        let mut streams = self.streams();
        self.triggered.store(true, Ordering::SeqCst);

        for (_, stream) in streams.drain(..) {
            // The peer may already be gone
            let _ = stream.shutdown(SocketShutdown::Both);
        }
        debug!("Shutdown triggered");
    }

    fn streams(&self) -> MutexGuard<'_, Vec<(u64, TcpStream)>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.shutdown.streams().retain(|(other, _)| *other != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn trigger_unblocks_reader() {
        let (client, _server) = connected_pair();

        let shutdown = Arc::new(Shutdown::new());
        let _registration = shutdown.register(&client).unwrap();

        let reader = thread::spawn(move || {
            let mut client = client;
            let mut buf = [0; 1];
            client.read(&mut buf)
        });

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.registered(), 0);

        // A shut down socket reads as end of stream
        let read = reader.join().unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn late_registration_is_closed() {
        let (mut client, _server) = connected_pair();

        let shutdown = Arc::new(Shutdown::new());
        shutdown.trigger();
        let _registration = shutdown.register(&client).unwrap();
        assert_eq!(shutdown.registered(), 0);

        let mut buf = [0; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn dropped_registration_is_forgotten() {
        let (first, _first_server) = connected_pair();
        let (second, _second_server) = connected_pair();

        let shutdown = Arc::new(Shutdown::new());
        let first_registration = shutdown.register(&first).unwrap();
        let second_registration = shutdown.register(&second).unwrap();
        assert_eq!(shutdown.registered(), 2);

        drop(first_registration);
        assert_eq!(shutdown.registered(), 1);

        drop(second_registration);
        assert_eq!(shutdown.registered(), 0);

        // Triggering afterwards leaves the streams alone
        shutdown.trigger();
        let mut first = first;
        first.set_nonblocking(true).unwrap();
        let mut buf = [0; 1];
        assert_eq!(
            first.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
