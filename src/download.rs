use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    manager::PieceManager,
    peer::{PeerSession, READ_TIMEOUT},
    piece::Piece,
    protocol::Message,
    torrent::Torrent,
    tracker::Peer,
};

/// How long a worker naps when every ready piece is leased elsewhere.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Futile replies (keep-alives, mismatched piece frames) tolerated within
/// one piece attempt before the lease is given back.
const FUTILE_REPLY_BUDGET: usize = 16;

/// Cooperative cancellation signal shared by the coordinator and its
/// workers.
///
/// Once triggered, every worker returns its current lease to the
/// scheduler and drops its socket at the next loop boundary (bounded by
/// the per-frame read timeout).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Generates the 20-byte client identifier, once per download.
///
/// Azureus-style prefix followed by twelve random digits. The id is
/// threaded through every constructor that needs it rather than cached
/// globally.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-RS0001-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = b'0' + rng.gen_range(0..10u8);
    }
    id
}

/// Downloads the resource described by `torrent` from `peers` and returns
/// the assembled, piece-verified bytes.
///
/// One worker task runs per peer, all sharing one scheduler. The download
/// succeeds once every piece is verified; it fails with
/// [`Error::Exhausted`] when every worker has exited while work remains.
pub async fn download(
    torrent: &Torrent,
    peers: Vec<Peer>,
    peer_id: [u8; 20],
) -> Result<Vec<u8>, Error> {
    download_with(torrent, peers, peer_id, CancelToken::new()).await
}

/// [`download`] with an externally held cancellation token.
pub async fn download_with(
    torrent: &Torrent,
    peers: Vec<Peer>,
    peer_id: [u8; 20],
    cancel: CancelToken,
) -> Result<Vec<u8>, Error> {
    let manager = PieceManager::new(torrent)?;
    let total = manager.remaining();
    if peers.is_empty() {
        return Err(Error::Exhausted { remaining: total });
    }

    info!(
        name = %torrent.info.name,
        pieces = total,
        peers = peers.len(),
        "starting download"
    );

    let shared = Arc::new(Mutex::new(manager));
    let info_hash = torrent.info_hash();

    let workers = peers.into_iter().map(|peer| {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            worker(peer, shared, info_hash, peer_id, cancel).await;
        })
    });
    join_all(workers).await;

    let manager = Arc::try_unwrap(shared)
        .map_err(|_| Error::Exhausted { remaining: total })?
        .into_inner();

    if manager.is_done() {
        info!("download complete");
        Ok(manager.into_output())
    } else {
        Err(Error::Exhausted {
            remaining: manager.remaining(),
        })
    }
}

/// Outcome of one piece attempt against one peer.
enum Attempt {
    /// Every block was filled; the piece is ready for verification
    Complete,
    /// The pass ended with blocks still missing
    Incomplete,
    /// The peer choked us; the session is unusable from here on
    Choked,
}

/// Per-peer worker: one session, pulling work until the scheduler runs
/// dry or the session fails. A failed worker does not reconnect.
async fn worker(
    peer: Peer,
    manager: Arc<Mutex<PieceManager>>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    cancel: CancelToken,
) {
    let mut session = match PeerSession::connect(&peer, info_hash, peer_id).await {
        Ok(session) => session,
        Err(e) => {
            debug!(peer = %peer, error = %e, "skipping peer");
            return;
        }
    };

    if let Err(e) = run_session(&mut session, &manager, &cancel).await {
        warn!(peer = %session.addr(), error = %e, "worker terminated");
    }
}

async fn run_session(
    session: &mut PeerSession,
    manager: &Arc<Mutex<PieceManager>>,
    cancel: &CancelToken,
) -> Result<(), Error> {
    session.send_interested().await?;
    session.send_unchoke().await?;

    // Consecutive pieces the peer did not have; once it exceeds the queue
    // length every ready piece has been offered to this peer.
    let mut skipped = 0usize;

    loop {
        if cancel.is_cancelled() {
            debug!(peer = %session.addr(), "cancelled");
            return Ok(());
        }

        let (piece, remaining, done) = {
            let mut guard = manager.lock().await;
            (guard.take_work(), guard.remaining(), guard.is_done())
        };

        let Some(mut piece) = piece else {
            if done {
                return Ok(());
            }
            // All remaining pieces are leased to other workers; one of
            // them may yet be returned.
            tokio::time::sleep(IDLE_WAIT).await;
            continue;
        };

        if !session.has_piece(piece.index) {
            manager.lock().await.return_work(piece);
            skipped += 1;
            if skipped >= remaining {
                debug!(peer = %session.addr(), "peer has none of the remaining pieces");
                return Ok(());
            }
            continue;
        }
        skipped = 0;

        match attempt_piece(session, &mut piece, cancel).await {
            Ok(Attempt::Complete) => {
                // A hash mismatch is logged and re-queued by the manager;
                // the worker simply moves on to other work.
                let _ = manager.lock().await.complete_work(piece);
            }
            Ok(Attempt::Incomplete) => {
                debug!(peer = %session.addr(), piece = piece.index, "piece incomplete, returning lease");
                manager.lock().await.return_work(piece);
                return Ok(());
            }
            Ok(Attempt::Choked) => {
                manager.lock().await.return_work(piece);
                return Ok(());
            }
            Err(e) => {
                manager.lock().await.return_work(piece);
                return Err(e);
            }
        }
    }
}

/// Requests each block of `piece` strictly in sequence and folds the
/// replies into it.
///
/// A keep-alive re-queues the current block without counting as a
/// failure; a mismatched or ignored reply re-queues it against a small
/// budget so a peer sending junk cannot pin the worker forever.
async fn attempt_piece(
    session: &mut PeerSession,
    piece: &mut Piece,
    cancel: &CancelToken,
) -> Result<Attempt, Error> {
    debug!(peer = %session.addr(), piece = piece.index, blocks = piece.remaining_blocks(), "downloading piece");
    let mut futile = 0usize;

    while let Some(mut block) = piece.pop_block() {
        if cancel.is_cancelled() || session.is_choked() {
            piece.requeue_block(block);
            return Ok(Attempt::Choked);
        }

        session
            .send_request(
                block.piece_index as u32,
                block.begin as u32,
                block.length as u32,
            )
            .await?;

        let message = session.receive(READ_TIMEOUT).await?;
        if message == Message::KeepAlive {
            debug!(peer = %session.addr(), block = block.begin, "keep-alive instead of data");
            piece.requeue_block(block);
            futile += 1;
            if futile > FUTILE_REPLY_BUDGET {
                return Ok(Attempt::Incomplete);
            }
            continue;
        }

        session.dispatch(message, &mut block);
        if session.is_choked() {
            piece.requeue_block(block);
            return Ok(Attempt::Choked);
        }

        if block.data.is_empty() {
            // Mismatched reply; the block goes back in the queue.
            piece.requeue_block(block);
            futile += 1;
            if futile > FUTILE_REPLY_BUDGET {
                return Ok(Attempt::Incomplete);
            }
        } else {
            piece.fill(block);
        }
    }

    if piece.is_complete() {
        Ok(Attempt::Complete)
    } else {
        Ok(Attempt::Incomplete)
    }
}
