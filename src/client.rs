//! # BitTorrent Peer Client
//!
//! One session with one remote peer over TCP. A [`Client`] is created by a
//! successful handshake and owned by exactly one worker for its whole life.
//!
//! ## Session Setup
//!
//! 1. **Handshake**: Send ours, read theirs, check the info hash
//! 2. **Bitfield**: The peer's first message is expected to be its bitfield;
//!    anything else leaves the peer with an empty bitfield
//! 3. **Unchoke + Interested**: Always sent, we are willing to serve and receive
//!
//! ## Connection State
//!
//! Reading a message updates the session before the message is handed back:
//!
//! - **CHOKE / UNCHOKE**: Whether the peer currently accepts our requests
//! - **HAVE / BITFIELD**: Which pieces the peer has
//!
//! Requests sent on the connection are remembered until their block comes
//! back, so that blocks answering an abandoned attempt can be told apart from
//! unsolicited ones.
//!
//! Every read and write is bounded by the I/O deadline from [`Settings`]. The
//! socket is shut down when the client is dropped.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::bitfield::Bitfield;
use crate::config::Settings;
use crate::error::PeerError;
use crate::handshake::{deserialize_handshake, Handshake, InfoHash, PeerId};
use crate::message::*;
use crate::peer::Peer;

/// Number of unanswered requests remembered per connection.
///
/// Requests a peer never answers are forgotten oldest first.
const MAX_TRACKED_REQUESTS: usize = 64;

/// A live session with a remote peer.
pub struct Client {
    /// Information about the remote peer
    peer: Peer,
    /// TCP stream connected to the peer
    conn: TcpStream,
    /// Pieces the peer has, as far as it told us
    bitfield: Bitfield,
    /// Whether the peer refuses our requests for now
    choked: bool,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: InfoHash,
    /// Peer id the remote peer sent in its handshake
    remote_id: PeerId,
    /// `(index, begin, length)` of requests sent and not answered yet
    requests: VecDeque<(u32, u32, u32)>,
}

impl Client {
    /// Connects to `peer` and sets up a session.
    ///
    /// # Arguments
    ///
    /// * `peer` - Remote peer to connect to
    /// * `peer_id` - 20-byte unique ID of this client
    /// * `info_hash` - Torrent both sides must agree on
    /// * `settings` - Connect timeout and I/O deadline
    ///
    /// # Errors
    ///
    /// - [`PeerError::Handshake`] if the connection or handshake fails
    /// - [`PeerError::HandshakeMismatch`] if the peer answers with another info hash
    /// - any I/O error while reading the first message or announcing interest
    pub fn connect(
        peer: &Peer,
        peer_id: PeerId,
        info_hash: InfoHash,
        settings: &Settings,
    ) -> Result<Client, PeerError> {
        // Open the connection
        let conn = TcpStream::connect_timeout(&peer.socket_addr(), settings.connect_timeout)
            .map_err(|e| PeerError::from(e).into_handshake())?;

        info!("Connected to peer {}", peer);

        Client::from_stream(peer.clone(), conn, peer_id, info_hash, settings.io_timeout)
    }

    /// Sets up a session over an already connected stream.
    ///
    /// Applies `io_timeout` to reads and writes, then runs the handshake,
    /// reads the opening bitfield and announces interest.
    ///
    /// # Errors
    ///
    /// Same as [`Client::connect`], minus the connection itself.
    pub fn from_stream(
        peer: Peer,
        conn: TcpStream,
        peer_id: PeerId,
        info_hash: InfoHash,
        io_timeout: Duration,
    ) -> Result<Client, PeerError> {
        // Bound every read and write
        conn.set_read_timeout(Some(io_timeout))
            .and_then(|_| conn.set_write_timeout(Some(io_timeout)))
            .map_err(|e| PeerError::from(e).into_handshake())?;

        let mut client = Client {
            peer,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
            info_hash,
            remote_id: [0; 20],
            requests: VecDeque::new(),
        };

        // Exchange handshakes
        client.remote_id = client
            .handshake_with_peer(peer_id)
            .map_err(PeerError::into_handshake)?;
        debug!("Completed handshake with peer {}", client.peer);

        // Get the pieces the peer has
        client.read_bitfield()?;

        // Ask to be unchoked
        client.send_unchoke()?;
        client.send_interested()?;

        Ok(client)
    }

    /// Remote peer of this session.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Info hash both sides agreed on.
    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// Peer id from the remote handshake.
    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    /// Underlying socket, e.g. to register it for shutdown.
    pub fn stream(&self) -> &TcpStream {
        &self.conn
    }

    /// Pieces the peer announced so far.
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Number of requests sent and not answered yet.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Returns whether the peer has choked us.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Checks if the peer has announced piece `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Sends our handshake and checks the one the peer answers with.
    ///
    /// Returns the remote peer id.
    fn handshake_with_peer(&mut self, peer_id: PeerId) -> Result<PeerId, PeerError> {
        // Send ours
        let handshake = Handshake::new(self.info_hash, peer_id);
        self.conn.write_all(&handshake.serialize()?)?;

        // Get theirs and check it is for the same torrent
        let received = deserialize_handshake(&mut self.conn)?;
        if received.info_hash != self.info_hash {
            return Err(PeerError::HandshakeMismatch {
                expected: self.info_hash,
                received: received.info_hash,
            });
        }

        Ok(received.peer_id)
    }

    /// Reads the peer's opening message, expected to be its bitfield.
    fn read_bitfield(&mut self) -> Result<(), PeerError> {
        match self.read_message()? {
            Some(message) if message.id == MessageId::Bitfield => {
                info!(
                    "Receive MESSAGE_BITFIELD ({} bytes) from peer {}",
                    message.payload.len(),
                    self.peer
                );
            }
            Some(message) => warn!(
                "Peer {} opened with {:?} instead of a bitfield, assuming it has no pieces",
                self.peer, message.id
            ),
            None => warn!(
                "Peer {} opened with a keep-alive, assuming it has no pieces",
                self.peer
            ),
        }

        Ok(())
    }

    /// Reads the next message from the peer, blocking until one arrives.
    ///
    /// Choke state and bitfield are updated before the message is returned.
    /// A keep-alive is returned as `None`.
    pub fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        let message = match deserialize_message(&mut self.conn)? {
            Some(message) => message,
            None => {
                debug!("Receive KEEP_ALIVE from peer {}", self.peer);
                return Ok(None);
            }
        };

        debug!("Receive {:?} from peer {}", message.id, self.peer);

        match message.id {
            MessageId::Choke => self.choked = true,
            MessageId::Unchoke => self.choked = false,
            MessageId::Have => {
                let index = parse_have(&message)?;
                match self.bitfield.set_piece(index) {
                    Ok(bitfield) => self.bitfield = bitfield,
                    Err(e) => warn!("Ignoring MESSAGE_HAVE from peer {}: {}", self.peer, e),
                }
            }
            MessageId::Bitfield => self.bitfield = Bitfield::from(message.payload.clone()),
            _ => {}
        }

        Ok(Some(message))
    }

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let message_encoded = message.serialize()?;
        self.conn.write_all(&message_encoded)?;

        debug!("Send {:?} to peer {}", message.id, self.peer);

        Ok(())
    }

    /// Tells the peer we accept its requests.
    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        self.send(&Message::new(MessageId::Unchoke))
    }

    /// Tells the peer we want to download from it.
    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        self.send(&Message::new(MessageId::Interested))
    }

    /// Announces that we now have piece `index`.
    pub fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        self.send(&Message::have(index))
    }

    /// Requests `length` bytes at `begin` within piece `index`.
    ///
    /// The request is remembered until [`Client::settle_request`] matches it
    /// with its block.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        debug!(
            "Request piece {} [{}:{}] from peer {}",
            index,
            begin,
            begin.saturating_add(length),
            self.peer
        );
        self.send(&Message::request(index, begin, length))?;

        if self.requests.len() == MAX_TRACKED_REQUESTS {
            self.requests.pop_front();
        }
        self.requests.push_back((index, begin, length));

        Ok(())
    }

    /// Matches a received block with a request sent on this connection.
    ///
    /// # Arguments
    ///
    /// * `index` - Piece index of the block
    /// * `begin` - Offset of the block within the piece
    /// * `length` - Length of the block data
    ///
    /// # Returns
    ///
    /// `true` if we asked for this block, in which case the oldest matching
    /// request is forgotten. `false` for an unsolicited block.
    pub fn settle_request(&mut self, index: u32, begin: u32, length: usize) -> bool {
        let position = self
            .requests
            .iter()
            .position(|&(i, b, l)| i == index && b == begin && l as usize == length);

        match position {
            Some(position) => {
                self.requests.remove(position);
                true
            }
            None => false,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.conn.shutdown(Shutdown::Both) {
            debug!("Error shutting down connection to peer {}: {}", self.peer, e);
        }
    }
}
