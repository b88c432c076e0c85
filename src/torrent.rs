use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::Error;

/// Represents a parsed single-file .torrent file.
///
/// Immutable once parsed; shared read-only by the tracker, the scheduler
/// and every peer session.
#[derive(Debug, Serialize, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info: Info,
    #[serde(skip)]
    info_raw_bytes: Vec<u8>,
}

/// Fields inside the `info` dictionary of a .torrent file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: i64,
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`].
    ///
    /// The raw bencoded `info` dictionary is kept around so the info hash
    /// can be computed over the exact bytes the tracker and peers expect.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = fs::read(path).map_err(|e| Error::Parse(e.to_string()))?;
        Self::from_bytes(&data)
    }

    /// Parses a bencoded .torrent byte stream.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data).map_err(|e| Error::Parse(e.to_string()))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| Error::Parse("missing info dictionary".into()))?;

        let info_raw_bytes =
            serde_bencode::to_bytes(info_value).map_err(|e| Error::Parse(e.to_string()))?;

        let torrent: Torrent =
            serde_bencode::from_bytes(data).map_err(|e| Error::Parse(e.to_string()))?;

        if torrent.info.pieces.len() % 20 != 0 {
            return Err(Error::Parse(format!(
                "pieces field length {} is not a multiple of 20",
                torrent.info.pieces.len()
            )));
        }

        Ok(Torrent {
            info_raw_bytes,
            ..torrent
        })
    }

    /// Computes the SHA-1 hash of the bencoded `info` dictionary.
    pub fn info_hash(&self) -> [u8; 20] {
        let digest = Sha1::digest(&self.info_raw_bytes);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        arr
    }

    /// Total size of the described file in bytes.
    pub fn length(&self) -> usize {
        self.info.length as usize
    }

    /// Declared length of each piece; the last piece may be shorter.
    pub fn piece_length(&self) -> usize {
        self.info.piece_length as usize
    }

    /// Number of pieces the resource is divided into.
    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected SHA-1 digest of each piece, in piece order.
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect()
    }

    pub fn describe(&self) {
        info!(
            name = %self.info.name,
            announce = %self.announce,
            info_hash = %hex::encode(self.info_hash()),
            length = self.length(),
            piece_length = self.piece_length(),
            pieces = self.pieces_count(),
            "parsed torrent"
        );
    }
}
