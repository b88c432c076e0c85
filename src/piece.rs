use std::collections::{BTreeMap, VecDeque};

/// Standard block size: pieces are requested in 16 KiB sub-units.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Lifecycle of a piece inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Queued, available for any worker to take
    Ready,
    /// Handed to a worker; the worker holds a lease, not ownership
    Leased,
    /// All blocks downloaded and the SHA-1 matched (terminal)
    Verified,
}

/// A contiguous sub-unit of a piece, exchanged per request/reply pair.
///
/// The last block of a piece may be shorter than [`BLOCK_SIZE`] when the
/// piece length is not a multiple of it.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index of the piece this block belongs to
    pub piece_index: usize,
    /// Offset (in bytes) from the start of the piece
    pub begin: usize,
    /// Length of the block in bytes
    pub length: usize,
    /// Payload, empty until the matching `piece` frame arrives
    pub data: Vec<u8>,
}

/// One hash-verifiable segment of the resource, composed of blocks.
#[derive(Debug, Clone)]
pub struct Piece {
    /// Index of the piece (0-based)
    pub index: usize,
    /// Expected SHA-1 digest of the assembled piece
    pub hash: [u8; 20],
    /// Total length of the piece in bytes
    pub length: usize,
    /// Blocks still to be downloaded, consumed front to back
    blocks: VecDeque<Block>,
    /// Downloaded block payloads keyed by offset within the piece
    block_data: BTreeMap<usize, Vec<u8>>,
    status: PieceStatus,
}

impl Piece {
    pub fn new(index: usize, hash: [u8; 20], length: usize) -> Self {
        Self {
            index,
            hash,
            length,
            blocks: Self::partition(index, length),
            block_data: BTreeMap::new(),
            status: PieceStatus::Ready,
        }
    }

    /// Splits a piece of `length` bytes into `ceil(length / BLOCK_SIZE)`
    /// blocks whose lengths sum to `length` exactly.
    fn partition(index: usize, length: usize) -> VecDeque<Block> {
        (0..length)
            .step_by(BLOCK_SIZE)
            .map(|begin| Block {
                piece_index: index,
                begin,
                length: BLOCK_SIZE.min(length - begin),
                data: Vec::new(),
            })
            .collect()
    }

    pub fn status(&self) -> PieceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PieceStatus) {
        self.status = status;
    }

    /// Takes the next block to request, if any remain.
    pub fn pop_block(&mut self) -> Option<Block> {
        self.blocks.pop_front()
    }

    /// Puts a block back at the end of the queue, e.g. after a keep-alive
    /// arrived instead of data.
    pub fn requeue_block(&mut self, mut block: Block) {
        block.data.clear();
        self.blocks.push_back(block);
    }

    /// Records a downloaded block's payload, keyed by its offset.
    pub fn fill(&mut self, block: Block) {
        self.block_data.insert(block.begin, block.data);
    }

    pub fn remaining_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// True once the accumulated payloads cover the whole piece.
    pub fn is_complete(&self) -> bool {
        self.block_data.values().map(Vec::len).sum::<usize>() == self.length
    }

    /// Concatenates the accumulated payloads in offset order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for data in self.block_data.values() {
            out.extend_from_slice(data);
        }
        out
    }

    /// Discards all accumulated data and rebuilds the block queue.
    ///
    /// A returned piece is always re-downloaded from scratch: the protocol
    /// offers no way to resume a partial piece without re-validating every
    /// byte.
    pub fn reset(&mut self) {
        self.blocks = Self::partition(self.index, self.length);
        self.block_data.clear();
        self.status = PieceStatus::Ready;
    }
}
