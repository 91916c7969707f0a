//! # Xerus Wire
//!
//! BitTorrent peer wire protocol engine and multi-peer piece downloader.
//!
//! ## Layers
//!
//! - **Codecs**: [`handshake`], [`message`] and [`bitfield`] turn bytes into
//!   protocol values and back
//! - **Connection**: [`client`] owns one peer socket and tracks its state
//! - **Pieces**: [`piece`] pipelines block requests and verifies the result
//! - **Coordination**: [`queue`], [`worker`] and [`download`] share the pieces
//!   between one thread per peer and collect what they verify
//! - **Metadata**: [`torrent`] and [`tracker`] find out what to download and
//!   from whom

#[macro_use]
extern crate log;

pub mod bitfield;
pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod queue;
pub mod shutdown;
pub mod torrent;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{DownloadConfig, Settings};
pub use download::Downloader;
pub use error::{DownloadError, PeerError};
pub use piece::PieceResult;
pub use torrent::Torrent;
