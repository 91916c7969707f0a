//! # BitTorrent Peer Wire Messages
//!
//! Every message after the handshake is framed the same way:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! A frame with a length prefix of 0 is a keep-alive. It carries no ID and is
//! represented as `None` on both the serialize and the parse side.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//!
//! ## Size Limit
//!
//! The largest legitimate payload is a PIECE carrying a full 16 KiB block, so
//! payloads are capped at `MAX_BLOCK_LEN + 8` bytes. Anything bigger is refused
//! before allocation on receive, and before writing on send.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::PeerError;

/// Largest block a peer may be asked for (2^14 bytes).
pub const MAX_BLOCK_LEN: u32 = 16384;

/// Size of the `index` and `begin` fields heading a PIECE payload.
const PIECE_HEADER_LEN: usize = 8;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_LEN: usize = MAX_BLOCK_LEN as usize + PIECE_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        let id = match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(id)
    }
}

/// A typed peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: Vec<u8>,
}

/// A block of piece data carried by a PIECE message.
#[derive(Debug, PartialEq, Eq)]
pub struct Block<'a> {
    pub index: u32,
    pub begin: u32,
    pub data: &'a [u8],
}

/// A block asked for by a REQUEST (or withdrawn by a CANCEL) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Message {
    /// Build a new message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    /// Build a HAVE message for `index`.
    pub fn have(index: u32) -> Self {
        Message::new_with_payload(MessageId::Have, index.to_be_bytes().to_vec())
    }

    /// Build a REQUEST message for `length` bytes at `begin` within piece `index`.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::new_with_payload(MessageId::Request, payload)
    }

    /// Build a PIECE message carrying `data` at `begin` within piece `index`.
    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(PIECE_HEADER_LEN + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        Message::new_with_payload(MessageId::Piece, payload)
    }

    /// Serialize message.
    pub fn serialize(&self) -> Result<Vec<u8>, PeerError> {
        serialize_message(Some(self))
    }

    fn expect(&self, expected: MessageId) -> Result<(), PeerError> {
        if self.id != expected {
            return Err(PeerError::UnexpectedMessageType {
                expected,
                received: self.id,
            });
        }
        Ok(())
    }

    fn malformed(&self) -> PeerError {
        PeerError::MalformedPayload {
            id: self.id,
            len: self.payload.len(),
        }
    }
}

/// Serializes a message into a length-prefixed frame.
///
/// `None` serializes to a keep-alive (four zero bytes).
///
/// # Errors
///
/// Returns [`PeerError::PayloadTooLarge`] if the payload exceeds [`MAX_PAYLOAD_LEN`].
pub fn serialize_message(message: Option<&Message>) -> Result<Vec<u8>, PeerError> {
    let message = match message {
        Some(message) => message,
        None => return Ok(vec![0; 4]),
    };

    if message.payload.len() > MAX_PAYLOAD_LEN {
        return Err(PeerError::PayloadTooLarge(message.payload.len()));
    }

    // Length prefix covers the id byte and the payload
    let message_len = 1 + message.payload.len();
    let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);

    serialized.write_u32::<BigEndian>(message_len as u32)?;
    serialized.push(message.id as u8);
    serialized.extend_from_slice(&message.payload);

    Ok(serialized)
}

/// Reads one frame from `reader`.
///
/// Returns `Ok(None)` for a keep-alive.
///
/// # Errors
///
/// - [`PeerError::MessageTooLarge`] if the length prefix exceeds the limit
/// - [`PeerError::TruncatedInput`] if the stream ends mid-frame
/// - [`PeerError::UnknownMessageId`] if the ID is outside the base protocol
pub fn deserialize_message<R: Read>(reader: &mut R) -> Result<Option<Message>, PeerError> {
    // Get message length
    let message_len = reader.read_u32::<BigEndian>()?;
    if message_len == 0 {
        return Ok(None);
    }

    if message_len as usize > MAX_PAYLOAD_LEN + 1 {
        return Err(PeerError::MessageTooLarge(message_len));
    }

    // Get message id and payload
    let mut message_buf = vec![0; message_len as usize];
    reader.read_exact(&mut message_buf)?;

    let id = MessageId::try_from(message_buf[0])?;
    message_buf.remove(0);

    Ok(Some(Message::new_with_payload(id, message_buf)))
}

/// Extracts the piece index announced by a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32, PeerError> {
    message.expect(MessageId::Have)?;
    if message.payload.len() != 4 {
        return Err(message.malformed());
    }

    let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;
    Ok(index)
}

/// Splits a PIECE message into its index, offset and block data.
pub fn parse_piece(message: &Message) -> Result<Block<'_>, PeerError> {
    message.expect(MessageId::Piece)?;
    if message.payload.len() < PIECE_HEADER_LEN {
        return Err(message.malformed());
    }

    // Get piece index and block offset
    let mut cursor = Cursor::new(&message.payload[..PIECE_HEADER_LEN]);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;

    Ok(Block {
        index,
        begin,
        data: &message.payload[PIECE_HEADER_LEN..],
    })
}

/// Extracts the block asked for by a REQUEST message.
pub fn parse_request(message: &Message) -> Result<BlockRequest, PeerError> {
    message.expect(MessageId::Request)?;
    if message.payload.len() != 12 {
        return Err(message.malformed());
    }

    let mut cursor = Cursor::new(&message.payload);
    Ok(BlockRequest {
        index: cursor.read_u32::<BigEndian>()?,
        begin: cursor.read_u32::<BigEndian>()?,
        length: cursor.read_u32::<BigEndian>()?,
    })
}
