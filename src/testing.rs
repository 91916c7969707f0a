//! A scripted seeder used by tests.
//!
//! It listens on a local port, answers handshakes, advertises a bitfield and
//! serves blocks of the pieces it holds.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use crate::error::PeerError;
use crate::handshake::{deserialize_handshake, Handshake, InfoHash};
use crate::message::{deserialize_message, parse_request, Message, MessageId};
use crate::peer::Peer;

pub const INFO_HASH: InfoHash = [0x42; 20];

/// What the seeder sends right after its handshake.
#[derive(Clone)]
pub enum Opening {
    Bitfield,
    Message(Message),
    KeepAlive,
}

#[derive(Clone)]
pub struct FakeSeeder {
    /// Info hash put in the handshake reply
    pub info_hash: InfoHash,
    /// Full content of every piece, in order
    pub pieces: Vec<Vec<u8>>,
    /// Which pieces are advertised and served
    pub have: Vec<bool>,
    pub opening: Opening,
    /// Flip the first byte of every served block
    pub corrupt: bool,
    /// Label that many of the first blocks served with the wrong piece index
    pub wrong_index_blocks: usize,
    /// Send a keep-alive before every block
    pub keep_alive_between_blocks: bool,
    /// Choke the client once that many blocks were served, then unchoke it
    pub choke_after_blocks: Option<usize>,
    /// Requests received while the client was choked
    pub requests_while_choked: Arc<AtomicUsize>,
    /// Close the connection after serving that many blocks
    pub drop_after_blocks: Option<usize>,
    /// Blocks served across all connections
    pub served: Arc<AtomicUsize>,
}

impl FakeSeeder {
    pub fn new(pieces: Vec<Vec<u8>>) -> Self {
        let have = vec![true; pieces.len()];
        FakeSeeder {
            info_hash: INFO_HASH,
            pieces,
            have,
            opening: Opening::Bitfield,
            corrupt: false,
            wrong_index_blocks: 0,
            keep_alive_between_blocks: false,
            choke_after_blocks: None,
            requests_while_choked: Arc::new(AtomicUsize::new(0)),
            drop_after_blocks: None,
            served: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_have(mut self, have: Vec<bool>) -> Self {
        self.have = have;
        self
    }

    /// Starts accepting connections on an ephemeral local port.
    pub fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let seeder = self.clone();
                thread::spawn(move || {
                    let _ = seeder.serve(stream);
                });
            }
        });

        addr
    }

    fn bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0; self.have.len().div_ceil(8)];
        for (i, _) in self.have.iter().enumerate().filter(|(_, has)| **has) {
            bits[i / 8] |= 1 << (7 - i % 8);
        }
        bits
    }

    fn serve(&self, mut stream: TcpStream) -> Result<(), PeerError> {
        deserialize_handshake(&mut stream)?;
        let reply = Handshake::new(self.info_hash, [0xee; 20]);
        stream.write_all(&reply.serialize()?)?;

        match &self.opening {
            Opening::Bitfield => {
                let message = Message::new_with_payload(MessageId::Bitfield, self.bitfield());
                stream.write_all(&message.serialize()?)?;
            }
            Opening::Message(message) => stream.write_all(&message.serialize()?)?,
            Opening::KeepAlive => stream.write_all(&[0; 4])?,
        }

        let mut served = 0;
        loop {
            let Some(message) = deserialize_message(&mut stream)? else {
                continue;
            };

            match message.id {
                MessageId::Interested => {
                    stream.write_all(&Message::new(MessageId::Unchoke).serialize()?)?;
                }
                MessageId::Request => {
                    if self.drop_after_blocks == Some(served) {
                        return Ok(());
                    }

                    let request = parse_request(&message)?;
                    let piece = &self.pieces[request.index as usize];
                    let begin = request.begin as usize;
                    let mut block = piece[begin..begin + request.length as usize].to_vec();
                    if self.corrupt {
                        block[0] ^= 0xff;
                    }
                    let index = if served < self.wrong_index_blocks {
                        request.index + 1
                    } else {
                        request.index
                    };

                    served += 1;
                    self.served.fetch_add(1, Ordering::SeqCst);
                    if self.keep_alive_between_blocks {
                        stream.write_all(&[0; 4])?;
                    }
                    stream.write_all(&Message::piece(index, request.begin, &block).serialize()?)?;

                    if self.choke_after_blocks == Some(served) {
                        self.choke(&mut stream)?;
                    }
                }
                _ => {}
            }
        }
    }

    /// Chokes the client for a while and counts the requests it still sends.
    ///
    /// Requests already on the wire when the choke is sent are dropped
    /// unanswered, as a real peer would.
    fn choke(&self, stream: &mut TcpStream) -> Result<(), PeerError> {
        stream.write_all(&Message::new(MessageId::Choke).serialize()?)?;

        drain_for(stream, Duration::from_millis(150))?;
        let violations = drain_for(stream, Duration::from_millis(250))?;
        self.requests_while_choked
            .fetch_add(violations, Ordering::SeqCst);

        stream.write_all(&Message::new(MessageId::Unchoke).serialize()?)?;
        Ok(())
    }
}

/// Reads and drops messages for `window`, returning how many were requests.
fn drain_for(stream: &mut TcpStream, window: Duration) -> Result<usize, PeerError> {
    let deadline = Instant::now() + window;
    let mut requests = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        stream.set_read_timeout(Some(deadline - now))?;
        match deserialize_message(stream) {
            Ok(Some(message)) if message.id == MessageId::Request => requests += 1,
            Ok(_) => {}
            Err(PeerError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }

    stream.set_read_timeout(None)?;
    Ok(requests)
}

/// Deterministic content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn split_pieces(content: &[u8], piece_length: usize) -> Vec<Vec<u8>> {
    content.chunks(piece_length).map(|c| c.to_vec()).collect()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hash = [0; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    hash
}

pub fn local_peer(id: u32, addr: SocketAddr) -> Peer {
    match addr {
        SocketAddr::V4(addr) => Peer::new(id, *addr.ip(), addr.port()),
        SocketAddr::V6(_) => unreachable!("seeders bind to IPv4"),
    }
}
