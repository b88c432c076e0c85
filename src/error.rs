use thiserror::Error;

/// Crate-level error type.
///
/// Per-peer and per-piece failures are recovered locally by the download
/// workers; only [`Error::Exhausted`] reaches the caller of `download`.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading or decoding a .torrent file failed.
    #[error("torrent parse error: {0}")]
    Parse(String),

    /// The tracker announce failed or returned an undecodable response.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// A TCP connection could not be established (refused, unreachable,
    /// or connect timeout).
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// The peer handshake failed: malformed reply or info-hash mismatch.
    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    /// A wire frame violated the protocol and could not be skipped.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// No frame arrived within the read deadline.
    #[error("peer {addr} timed out")]
    Timeout { addr: String },

    /// A completed piece failed SHA-1 verification.
    #[error("piece {index} failed hash verification")]
    HashMismatch { index: usize },

    /// Every worker exited while pieces were still missing.
    #[error("all peers exhausted with {remaining} pieces remaining")]
    Exhausted { remaining: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
