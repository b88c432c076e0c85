use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::torrent::Torrent;

/// Port advertised to the tracker as our listening port.
pub const LISTEN_PORT: u16 = 6881;

/// A candidate remote endpoint returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Handles the announce exchange with a BitTorrent tracker.
pub struct Tracker;

/// The bencoded dictionary returned by a tracker announce request.
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "peers")]
    pub peers_data: Value,
    pub interval: Option<i64>,
}

impl AnnounceResponse {
    /// Decodes the `peers` value into endpoint records.
    ///
    /// With `compact=1` trackers reply with one byte string of 6-byte
    /// entries (4-byte IPv4 + 2-byte big-endian port); some older trackers
    /// send a list of `{ip, port}` dictionaries instead, which is handled
    /// as a fallback.
    pub fn peers(&self) -> Vec<Peer> {
        let mut result = Vec::new();

        match &self.peers_data {
            Value::Bytes(data) => {
                if data.len() % 6 != 0 {
                    warn!(len = data.len(), "compact peer list not a multiple of 6, ignoring tail");
                }
                for chunk in data.chunks_exact(6) {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    result.push(Peer {
                        ip: IpAddr::V4(ip),
                        port,
                    });
                }
            }
            Value::List(list) => {
                for item in list {
                    if let Value::Dict(dict) = item {
                        let ip = dict
                            .get(&b"ip".to_vec())
                            .and_then(|v| match v {
                                Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                                _ => None,
                            })
                            .and_then(|s| s.parse::<IpAddr>().ok());

                        let port = dict.get(&b"port".to_vec()).and_then(|v| match v {
                            Value::Int(n) if (0..=65535).contains(n) => Some(*n as u16),
                            _ => None,
                        });

                        if let (Some(ip), Some(port)) = (ip, port) {
                            result.push(Peer { ip, port });
                        }
                    }
                }
            }
            _ => {}
        }
        result
    }
}

impl Tracker {
    /// Sends an announce request and returns the candidate peer list.
    ///
    /// Query parameters follow the original announce convention:
    /// `info_hash, peer_id, port, left, uploaded, downloaded, compact=1`.
    pub async fn announce(
        &self,
        torrent: &Torrent,
        peer_id: &[u8; 20],
    ) -> Result<Vec<Peer>, Error> {
        let base_url =
            Url::parse(&torrent.announce).map_err(|e| Error::Tracker(e.to_string()))?;

        let info_hash = torrent.info_hash();
        let params = [
            (
                "info_hash",
                percent_encode(&info_hash, NON_ALPHANUMERIC).to_string(),
            ),
            (
                "peer_id",
                percent_encode(peer_id, NON_ALPHANUMERIC).to_string(),
            ),
            ("port", LISTEN_PORT.to_string()),
            ("left", torrent.length().to_string()),
            ("uploaded", 0u64.to_string()),
            ("downloaded", 0u64.to_string()),
            ("compact", 1.to_string()),
        ];

        // info_hash and peer_id are raw bytes, so the query string is built
        // by hand rather than through the url form encoder.
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let url = format!("{}?{}", base_url, query);
        debug!(%url, "announcing to tracker");

        let client = Client::new();
        let raw = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let resp: AnnounceResponse =
            de::from_bytes(&raw).map_err(|e| Error::Tracker(e.to_string()))?;

        let peers = resp.peers();
        debug!(count = peers.len(), interval = ?resp.interval, "tracker returned peers");
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_list() {
        // 50 entries of 6 bytes each, as in a real compact announce reply.
        let mut data = Vec::with_capacity(300);
        for i in 0..50u16 {
            data.extend_from_slice(&[10, 0, (i >> 8) as u8, (i & 0xff) as u8]);
            data.extend_from_slice(&(6881 + i).to_be_bytes());
        }
        assert_eq!(data.len(), 300);

        let resp = AnnounceResponse {
            peers_data: Value::Bytes(data),
            interval: Some(1800),
        };
        let peers = resp.peers();
        assert_eq!(peers.len(), 50);
        assert_eq!(peers[0].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[49].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 49)));
        assert_eq!(peers[49].port, 6930);
    }

    #[test]
    fn ignores_trailing_partial_entry() {
        let resp = AnnounceResponse {
            peers_data: Value::Bytes(vec![127, 0, 0, 1, 0x1a, 0xe1, 9, 9]),
            interval: None,
        };
        let peers = resp.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 6881);
    }

    #[test]
    fn decodes_dictionary_peer_list() {
        let mut dict = std::collections::HashMap::new();
        dict.insert(b"ip".to_vec(), Value::Bytes(b"192.168.1.1".to_vec()));
        dict.insert(b"port".to_vec(), Value::Int(6881));

        let mut bad = std::collections::HashMap::new();
        bad.insert(b"ip".to_vec(), Value::Bytes(b"not an ip".to_vec()));
        bad.insert(b"port".to_vec(), Value::Int(6881));

        let resp = AnnounceResponse {
            peers_data: Value::List(vec![Value::Dict(dict), Value::Dict(bad)]),
            interval: None,
        };
        let peers = resp.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers[0],
            Peer {
                ip: "192.168.1.1".parse().unwrap(),
                port: 6881
            }
        );
    }

    #[test]
    fn full_bencoded_response_round_trip() {
        // d8:intervali1800e5:peers6:<6 bytes>e
        let mut raw: Vec<u8> = Vec::new();
        raw.extend_from_slice(b"d8:intervali1800e5:peers6:");
        raw.extend_from_slice(&[192, 168, 1, 1, 0x1a, 0xe1]);
        raw.push(b'e');

        let resp: AnnounceResponse = de::from_bytes(&raw).unwrap();
        assert_eq!(resp.interval, Some(1800));
        let peers = resp.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].to_string(), "192.168.1.1:6881");
    }
}
