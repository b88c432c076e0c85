use std::collections::VecDeque;

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::Error;
use crate::piece::{Piece, PieceStatus};
use crate::torrent::Torrent;

/// Single source of truth for what work remains and what is done.
///
/// Workers share one manager behind a mutex and interact with it only
/// through [`take_work`](PieceManager::take_work),
/// [`return_work`](PieceManager::return_work) and
/// [`complete_work`](PieceManager::complete_work); the queue itself is
/// never exposed.
pub struct PieceManager {
    queue: VecDeque<Piece>,
    piece_length: usize,
    total_pieces: usize,
    verified: usize,
    output: Vec<u8>,
}

impl PieceManager {
    /// Partitions the resource described by `torrent` into pieces.
    pub fn new(torrent: &Torrent) -> Result<Self, Error> {
        Self::from_parts(
            torrent.piece_hashes(),
            torrent.length(),
            torrent.piece_length(),
        )
    }

    /// Builds the work queue from raw descriptor fields.
    ///
    /// The last piece is `length % piece_length` bytes, or a full
    /// `piece_length` when the remainder is zero.
    pub fn from_parts(
        hashes: Vec<[u8; 20]>,
        length: usize,
        piece_length: usize,
    ) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::Parse("piece length must be nonzero".into()));
        }
        if hashes.len() != length.div_ceil(piece_length) {
            return Err(Error::Parse(format!(
                "{} piece hashes for a {}-byte resource with {}-byte pieces",
                hashes.len(),
                length,
                piece_length
            )));
        }

        let last_length = match length % piece_length {
            0 => piece_length,
            rem => rem,
        };
        let total_pieces = hashes.len();

        let queue = hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let piece_len = if index == total_pieces - 1 {
                    last_length
                } else {
                    piece_length
                };
                Piece::new(index, hash, piece_len)
            })
            .collect();

        Ok(Self {
            queue,
            piece_length,
            total_pieces,
            verified: 0,
            output: vec![0u8; length],
        })
    }

    /// Atomically removes and returns one `Ready` piece, marking it
    /// `Leased`. Order is FIFO but irrelevant to correctness.
    pub fn take_work(&mut self) -> Option<Piece> {
        let mut piece = self.queue.pop_front()?;
        piece.set_status(PieceStatus::Leased);
        Some(piece)
    }

    /// Re-queues a piece, discarding any partially downloaded block data.
    pub fn return_work(&mut self, mut piece: Piece) {
        piece.reset();
        self.queue.push_back(piece);
    }

    /// Verifies a fully downloaded piece and records its bytes in the
    /// output.
    ///
    /// A hash mismatch (or a piece with missing blocks) is treated exactly
    /// like a failed download: the piece goes back to the queue and
    /// nothing is written.
    pub fn complete_work(&mut self, mut piece: Piece) -> Result<(), Error> {
        if !piece.is_complete() {
            let index = piece.index;
            warn!(piece = index, "completed piece has missing blocks, re-queueing");
            self.return_work(piece);
            return Err(Error::HashMismatch { index });
        }

        let data = piece.assemble();
        let digest = Sha1::digest(&data);
        if digest[..] != piece.hash {
            let index = piece.index;
            warn!(piece = index, "hash mismatch, re-queueing");
            self.return_work(piece);
            return Err(Error::HashMismatch { index });
        }

        let offset = piece.index * self.piece_length;
        self.output[offset..offset + data.len()].copy_from_slice(&data);
        piece.set_status(PieceStatus::Verified);
        self.verified += 1;
        debug!(
            piece = piece.index,
            verified = self.verified,
            total = self.total_pieces,
            "piece verified"
        );
        Ok(())
    }

    /// Pieces not yet verified, whether queued or leased.
    pub fn remaining(&self) -> usize {
        self.total_pieces - self.verified
    }

    pub fn is_done(&self) -> bool {
        self.verified == self.total_pieces
    }

    /// Consumes the manager and yields the assembled output bytes.
    ///
    /// Only meaningful once [`is_done`](PieceManager::is_done) is true.
    pub fn into_output(self) -> Vec<u8> {
        self.output
    }
}
