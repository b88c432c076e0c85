use std::collections::HashSet;
use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    piece::{Block, BLOCK_SIZE},
    protocol::{Handshake, Message, HANDSHAKE_LEN},
    tracker::Peer,
};

/// Bound on establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for any single frame.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A peer may answer its first frames with unrelated or partial data, so
/// the handshake is retried a few times before the peer is given up on.
const HANDSHAKE_ATTEMPTS: usize = 5;

/// Largest frame a downloader legitimately receives: a `piece` payload of
/// one full block plus the id and header fields. The length prefix is
/// remote-controlled, so anything larger is rejected before allocating.
const MAX_FRAME_LEN: usize = BLOCK_SIZE + 9;

/// One TCP connection's full protocol lifecycle.
///
/// Created only after a verified handshake; owned and mutated by exactly
/// one download worker. Dropping the session closes the socket.
#[derive(Debug)]
pub struct PeerSession {
    addr: String,
    choked: bool,
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: BufWriter<WriteHalf<TcpStream>>,
    available_pieces: HashSet<usize>,
}

impl PeerSession {
    /// Opens a connection to `peer`, performs the handshake and reads the
    /// initial availability bitmap.
    ///
    /// Any connection error (refused, unreachable, connect timeout) yields
    /// [`Error::Connect`]; a malformed reply or info-hash mismatch yields
    /// [`Error::Handshake`] after the retry budget is spent.
    pub async fn connect(
        peer: &Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<Self, Error> {
        let addr = peer.to_string();

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Connect {
                addr: addr.clone(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| Error::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let (rh, wh) = tokio::io::split(stream);
        // A session is choked only once the remote signals it.
        let mut session = PeerSession {
            addr,
            choked: false,
            reader: BufReader::new(rh),
            writer: BufWriter::new(wh),
            available_pieces: HashSet::new(),
        };

        session.handshake(info_hash, peer_id).await?;
        session.read_initial_bitfield().await;

        info!(peer = %session.addr, "session established");
        Ok(session)
    }

    /// Sends our handshake and verifies the reply, up to
    /// [`HANDSHAKE_ATTEMPTS`] times.
    async fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<(), Error> {
        let encoded = Handshake::new(info_hash, peer_id).encode();
        let mut last_reason = String::from("no reply");

        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            if let Err(e) = self.write_all(&encoded).await {
                return Err(Error::Handshake {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                });
            }

            let mut buf = [0u8; HANDSHAKE_LEN];
            match timeout(READ_TIMEOUT, self.reader.read_exact(&mut buf)).await {
                Err(_) => {
                    last_reason = "handshake read timeout".into();
                    continue;
                }
                Ok(Err(e)) => {
                    last_reason = e.to_string();
                    continue;
                }
                Ok(Ok(_)) => {}
            }

            match Handshake::decode(&buf) {
                Ok(reply) if reply.info_hash == info_hash => {
                    debug!(peer = %self.addr, attempt, "handshake verified");
                    return Ok(());
                }
                Ok(_) => {
                    last_reason = "info hash mismatch".into();
                }
                Err(e) => {
                    last_reason = e.to_string();
                }
            }
            debug!(peer = %self.addr, attempt, reason = %last_reason, "handshake attempt failed");
        }

        Err(Error::Handshake {
            addr: self.addr.clone(),
            reason: last_reason,
        })
    }

    /// Reads the peer's first post-handshake frame, expected to be its
    /// availability bitmap. Some peers open with another frame instead
    /// (an early `have` or choke-state change); its transition is applied
    /// rather than dropped. A timeout leaves the map empty: the peer
    /// simply claims no pieces yet.
    async fn read_initial_bitfield(&mut self) {
        match self.receive(READ_TIMEOUT).await {
            Ok(message) => {
                if !matches!(message, Message::Bitfield(_)) {
                    debug!(peer = %self.addr, ?message, "first frame was not a bitfield");
                }
                self.apply(&message);
            }
            Err(e) => {
                debug!(peer = %self.addr, error = %e, "no bitfield received");
            }
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True while the remote has signaled it will not honor requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Bounds-checked availability lookup; out-of-range indices are
    /// simply not available.
    pub fn has_piece(&self, index: usize) -> bool {
        self.available_pieces.contains(&index)
    }

    pub async fn send_interested(&mut self) -> Result<(), Error> {
        debug!(peer = %self.addr, "sending interested");
        self.write_all(&Message::Interested.encode()).await
    }

    pub async fn send_unchoke(&mut self) -> Result<(), Error> {
        debug!(peer = %self.addr, "sending unchoke");
        self.write_all(&Message::Unchoke.encode()).await
    }

    /// Writes a `request` frame; the reply arrives later via
    /// [`PeerSession::receive`].
    pub async fn send_request(
        &mut self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), Error> {
        debug!(peer = %self.addr, index, begin, length, "requesting block");
        self.write_all(
            &Message::Request {
                index,
                begin,
                length,
            }
            .encode(),
        )
        .await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Blocks until one frame arrives or `deadline` elapses.
    ///
    /// An elapsed deadline yields [`Error::Timeout`] (a soft failure: the
    /// caller abandons its lease, not the protocol); a cleanly closed
    /// connection yields [`Error::Connect`]. A fully-read frame that fails
    /// to decode is logged and skipped, since the stream stays in sync.
    pub async fn receive(&mut self, deadline: Duration) -> Result<Message, Error> {
        loop {
            let mut length = [0u8; 4];
            timeout(deadline, self.reader.read_exact(&mut length))
                .await
                .map_err(|_| Error::Timeout {
                    addr: self.addr.clone(),
                })?
                .map_err(|e| Error::Connect {
                    addr: self.addr.clone(),
                    reason: format!("connection closed: {}", e),
                })?;

            let size = u32::from_be_bytes(length);
            if size == 0 {
                return Ok(Message::KeepAlive);
            }
            if size as usize > MAX_FRAME_LEN {
                return Err(Error::MalformedFrame(format!(
                    "frame declares {} bytes, limit is {}",
                    size, MAX_FRAME_LEN
                )));
            }

            let mut frame = vec![0u8; 4 + size as usize];
            frame[..4].copy_from_slice(&length);
            timeout(deadline, self.reader.read_exact(&mut frame[4..]))
                .await
                .map_err(|_| Error::Timeout {
                    addr: self.addr.clone(),
                })?
                .map_err(|e| Error::Connect {
                    addr: self.addr.clone(),
                    reason: format!("connection closed mid-frame: {}", e),
                })?;

            match Message::decode(&frame) {
                Ok(message) => return Ok(message),
                Err(e) => {
                    warn!(peer = %self.addr, error = %e, "skipping malformed frame");
                }
            }
        }
    }

    /// Applies a frame's session-level transition: the choke flag and
    /// piece availability. `piece` payloads need a leased block and go
    /// through [`PeerSession::dispatch`].
    fn apply(&mut self, message: &Message) {
        match message {
            Message::Choke => {
                info!(peer = %self.addr, "choked, session is done");
                self.choked = true;
            }
            Message::Unchoke => {
                debug!(peer = %self.addr, "unchoked");
                self.choked = false;
            }
            Message::Have(index) => {
                self.available_pieces.insert(*index as usize);
            }
            Message::Bitfield(bytes) => {
                for (i, byte) in bytes.iter().enumerate() {
                    for bit in 0..8 {
                        if byte & (0b1000_0000 >> bit) != 0 {
                            self.available_pieces.insert(i * 8 + bit);
                        }
                    }
                }
                debug!(peer = %self.addr, pieces = self.available_pieces.len(), "received bitfield");
            }
            // Not meaningful to a pure downloader.
            Message::KeepAlive
            | Message::Piece { .. }
            | Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. } => {}
        }
    }

    /// Applies a received frame to session state.
    ///
    /// `block` is the block currently leased by this worker; only a
    /// `piece` frame matching its (index, begin) fills it. Malformed or
    /// mismatched frames are logged and ignored. A `choke` marks the
    /// session unusable for further requests.
    pub fn dispatch(&mut self, message: Message, block: &mut Block) {
        if let Message::Piece {
            index,
            begin,
            block: data,
        } = message
        {
            if index as usize != block.piece_index || begin as usize != block.begin {
                warn!(
                    peer = %self.addr,
                    got_index = index,
                    got_begin = begin,
                    want_index = block.piece_index,
                    want_begin = block.begin,
                    "mismatched piece frame, discarding"
                );
            } else {
                block.data = data;
            }
        } else {
            self.apply(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_STR;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    fn loopback_peer(port: u16) -> Peer {
        Peer {
            ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            port,
        }
    }

    async fn read_handshake(stream: &mut TcpStream) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn connect_refused_yields_connect_error() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = PeerSession::connect(&loopback_peer(port), [1u8; 20], [2u8; 20])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }

    #[tokio::test]
    async fn mismatched_info_hash_rejects_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Reply to every handshake attempt with the wrong hash.
            for _ in 0..HANDSHAKE_ATTEMPTS {
                let _ = read_handshake(&mut stream).await;
                let reply = Handshake::new([9u8; 20], [3u8; 20]).encode();
                stream.write_all(&reply).await.unwrap();
            }
        });

        let err = PeerSession::connect(&loopback_peer(port), [1u8; 20], [2u8; 20])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn handshake_and_bitfield_establish_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info_hash = [7u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let ours = read_handshake(&mut stream).await;
            let decoded = Handshake::decode(&ours).unwrap();
            assert_eq!(decoded.info_hash, info_hash);
            assert_eq!(&ours[1..20], PROTOCOL_STR.as_bytes());

            let reply = Handshake::new(info_hash, [3u8; 20]).encode();
            stream.write_all(&reply).await.unwrap();
            // Pieces 0 and 9 available.
            stream
                .write_all(&Message::Bitfield(vec![0b1000_0000, 0b0100_0000]).encode())
                .await
                .unwrap();
            stream.flush().await.unwrap();

            // Hold the socket open until the client is done.
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let session = PeerSession::connect(&loopback_peer(port), info_hash, [2u8; 20])
            .await
            .unwrap();
        assert!(session.has_piece(0));
        assert!(session.has_piece(9));
        assert!(!session.has_piece(1));
        assert!(!session.has_piece(10_000));
        // Requests may flow right away; choked only after the remote
        // says so.
        assert!(!session.is_choked());
    }

    #[tokio::test]
    async fn receive_decodes_frames_and_keep_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info_hash = [7u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_handshake(&mut stream).await;
            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).encode())
                .await
                .unwrap();
            stream
                .write_all(&Message::Bitfield(vec![0xff]).encode())
                .await
                .unwrap();
            stream.write_all(&Message::KeepAlive.encode()).await.unwrap();
            stream.write_all(&Message::Unchoke.encode()).await.unwrap();
            stream.flush().await.unwrap();

            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let mut session = PeerSession::connect(&loopback_peer(port), info_hash, [2u8; 20])
            .await
            .unwrap();
        assert_eq!(
            session.receive(READ_TIMEOUT).await.unwrap(),
            Message::KeepAlive
        );
        assert_eq!(
            session.receive(READ_TIMEOUT).await.unwrap(),
            Message::Unchoke
        );
    }

    #[tokio::test]
    async fn dispatch_fills_only_matching_block() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info_hash = [7u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_handshake(&mut stream).await;
            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).encode())
                .await
                .unwrap();
            stream
                .write_all(&Message::Bitfield(vec![0xff]).encode())
                .await
                .unwrap();
            stream.flush().await.unwrap();

            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let mut session = PeerSession::connect(&loopback_peer(port), info_hash, [2u8; 20])
            .await
            .unwrap();

        let mut block = Block {
            piece_index: 2,
            begin: 16384,
            length: 4,
            data: Vec::new(),
        };

        // Wrong (index, begin) is discarded.
        session.dispatch(
            Message::Piece {
                index: 2,
                begin: 0,
                block: vec![9, 9, 9, 9],
            },
            &mut block,
        );
        assert!(block.data.is_empty());

        // Matching frame fills the lease.
        session.dispatch(
            Message::Piece {
                index: 2,
                begin: 16384,
                block: vec![1, 2, 3, 4],
            },
            &mut block,
        );
        assert_eq!(block.data, vec![1, 2, 3, 4]);

        // Unchoke then choke flip the flag; have updates availability.
        session.dispatch(Message::Unchoke, &mut block);
        assert!(!session.is_choked());
        session.dispatch(Message::Have(77), &mut block);
        assert!(session.has_piece(77));
        session.dispatch(Message::Choke, &mut block);
        assert!(session.is_choked());
    }

    #[tokio::test]
    async fn non_bitfield_first_frame_is_applied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info_hash = [7u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_handshake(&mut stream).await;
            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).encode())
                .await
                .unwrap();
            // Some peers announce a piece before any bitfield.
            stream.write_all(&Message::Have(5).encode()).await.unwrap();
            stream.flush().await.unwrap();

            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let session = PeerSession::connect(&loopback_peer(port), info_hash, [2u8; 20])
            .await
            .unwrap();
        assert!(session.has_piece(5));
        assert!(!session.has_piece(0));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let info_hash = [7u8; 20];

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_handshake(&mut stream).await;
            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).encode())
                .await
                .unwrap();
            stream
                .write_all(&Message::Bitfield(vec![0xff]).encode())
                .await
                .unwrap();
            // A length prefix no downloader frame can legitimately carry.
            stream.write_all(&0x7fff_ffffu32.to_be_bytes()).await.unwrap();
            stream.flush().await.unwrap();

            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let mut session = PeerSession::connect(&loopback_peer(port), info_hash, [2u8; 20])
            .await
            .unwrap();
        let err = session.receive(READ_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }
}
