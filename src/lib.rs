//! A minimal BitTorrent download client.
//!
//! The crate parses a single-file .torrent descriptor, asks the tracker
//! for peers, then downloads hash-verified pieces from many peers
//! concurrently over the peer wire protocol.

pub mod download;
pub mod error;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod torrent;
pub mod tracker;

pub use download::{download, download_with, generate_peer_id, CancelToken};
pub use error::Error;
pub use torrent::Torrent;
pub use tracker::{Peer, Tracker};
