use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use crate::error::Error;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent on a connection and is always 68
/// bytes: a 1-byte protocol-string length, the 19-byte protocol string,
/// 8 reserved zero bytes, the 20-byte `info_hash` and the 20-byte `peer_id`.
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string identifying the remote client
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array ready to be written to a
    /// TCP stream.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes a 68-byte handshake message.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(Error::MalformedFrame(format!(
                "handshake must be {} bytes, got {}",
                HANDSHAKE_LEN,
                buf.len()
            )));
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STR.len() {
            return Err(Error::MalformedFrame(format!(
                "invalid protocol string length: {}",
                pstrlen
            )));
        }

        if &buf[1..1 + pstrlen] != PROTOCOL_STR.as_bytes() {
            return Err(Error::MalformedFrame("invalid protocol string".into()));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// A peer wire protocol message exchanged after the handshake.
///
/// Every frame carries a 4-byte big-endian length prefix covering the id
/// byte and the payload; a zero-length frame is a keep-alive and has
/// neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame holding the connection open
    KeepAlive,
    /// `choke`: the peer will not honor our requests
    Choke,
    /// `unchoke`: the peer is willing to serve requests
    Unchoke,
    /// `interested`: we want pieces from the peer
    Interested,
    /// `not interested`
    NotInterested,
    /// `have`: the peer acquired the piece at this index
    Have(u32),
    /// `bitfield`: bitmap of pieces the peer holds
    Bitfield(Vec<u8>),
    /// `request`: ask for a block of a piece
    Request { index: u32, begin: u32, length: u32 },
    /// `piece`: a block of data in reply to a request
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// `cancel`: withdraw a previously sent request
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Serializes a `Message` into a byte vector for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => {
                buf.write_u32::<BigEndian>(0).unwrap();
            }
            Message::Choke => {
                buf.write_u32::<BigEndian>(1).unwrap();
                buf.write_u8(0).unwrap();
            }
            Message::Unchoke => {
                buf.write_u32::<BigEndian>(1).unwrap();
                buf.write_u8(1).unwrap();
            }
            Message::Interested => {
                buf.write_u32::<BigEndian>(1).unwrap();
                buf.write_u8(2).unwrap();
            }
            Message::NotInterested => {
                buf.write_u32::<BigEndian>(1).unwrap();
                buf.write_u8(3).unwrap();
            }
            Message::Have(index) => {
                buf.write_u32::<BigEndian>(5).unwrap();
                buf.write_u8(4).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
            }
            Message::Bitfield(bitfield) => {
                buf.write_u32::<BigEndian>((1 + bitfield.len()) as u32)
                    .unwrap();
                buf.write_u8(5).unwrap();
                buf.extend_from_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.write_u32::<BigEndian>(13).unwrap();
                buf.write_u8(6).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
                buf.write_u32::<BigEndian>(*begin).unwrap();
                buf.write_u32::<BigEndian>(*length).unwrap();
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.write_u32::<BigEndian>((9 + block.len()) as u32).unwrap();
                buf.write_u8(7).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
                buf.write_u32::<BigEndian>(*begin).unwrap();
                buf.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.write_u32::<BigEndian>(13).unwrap();
                buf.write_u8(8).unwrap();
                buf.write_u32::<BigEndian>(*index).unwrap();
                buf.write_u32::<BigEndian>(*begin).unwrap();
                buf.write_u32::<BigEndian>(*length).unwrap();
            }
        }
        buf
    }

    /// Parses a length-prefixed buffer into a `Message`.
    ///
    /// A zero length prefix decodes to [`Message::KeepAlive`].
    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::MalformedFrame(
                "buffer too short to read length prefix".into(),
            ));
        }

        let len = buf
            .read_u32::<BigEndian>()
            .map_err(|e| Error::MalformedFrame(e.to_string()))?;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        if buf.len() < len as usize {
            return Err(Error::MalformedFrame(format!(
                "frame declares {} bytes but only {} available",
                len,
                buf.len()
            )));
        }

        let id = buf
            .read_u8()
            .map_err(|e| Error::MalformedFrame(e.to_string()))?;

        let payload_len = len as usize - 1;

        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if payload_len != 4 {
                    return Err(Error::MalformedFrame(format!(
                        "have payload must be 4 bytes, got {}",
                        payload_len
                    )));
                }
                let index = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Message::Have(index))
            }
            5 => {
                let mut bitfield = vec![0u8; payload_len];
                buf.read_exact(&mut bitfield)
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Message::Bitfield(bitfield))
            }
            6 => {
                if payload_len != 12 {
                    return Err(Error::MalformedFrame(format!(
                        "request payload must be 12 bytes, got {}",
                        payload_len
                    )));
                }
                let index = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let begin = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let length = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                if payload_len < 8 {
                    return Err(Error::MalformedFrame(format!(
                        "piece payload must be at least 8 bytes, got {}",
                        payload_len
                    )));
                }
                let index = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let begin = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let mut block = vec![0u8; payload_len - 8];
                buf.read_exact(&mut block)
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Message::Piece {
                    index,
                    begin,
                    block,
                })
            }
            8 => {
                if payload_len != 12 {
                    return Err(Error::MalformedFrame(format!(
                        "cancel payload must be 12 bytes, got {}",
                        payload_len
                    )));
                }
                let index = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let begin = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                let length = buf
                    .read_u32::<BigEndian>()
                    .map_err(|e| Error::MalformedFrame(e.to_string()))?;
                Ok(Message::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            _ => Err(Error::MalformedFrame(format!("unknown message id: {}", id))),
        }
    }
}
