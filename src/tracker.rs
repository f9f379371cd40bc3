//! Tracker client
//!
//! Announce transports for HTTP/HTTPS (bencoded GET responses) and UDP (the
//! two-step connect/announce datagram exchange). Failover walks the primary
//! announce URL and then the announce-list tiers in order; a failure is only
//! surfaced to the caller when every tracker in the cycle failed.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use crate::bencode::{self, BencodeValue};
use crate::error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Peers requested per announce
pub const NUMWANT: u32 = 50;

/// Deadline for one HTTP request or one UDP round trip
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Magic constant opening every UDP connect request
const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// Announce intervals are clamped into this range (seconds)
const MIN_ANNOUNCE_INTERVAL: u32 = 60;
const MAX_ANNOUNCE_INTERVAL: u32 = 3600;

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Periodic refresh
    None,
    /// First announce of the session
    Started,
    /// Final announce on shutdown
    Stopped,
    /// One-shot announce on verified completion
    Completed,
}

impl AnnounceEvent {
    fn as_http_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn as_udp_id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Swarm identifier
    pub info_hash: Sha1Hash,
    /// Port we nominally listen on
    pub port: u16,
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Bytes remaining
    pub left: u64,
    /// Event for this announce
    pub event: AnnounceEvent,
}

/// Peer contact handed back by a tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    /// IP address (dictionary responses may carry a hostname; those are
    /// dropped by the validity filter)
    pub ip: String,
    /// Listening port
    pub port: u16,
    /// Peer id, when the dictionary form includes one
    pub peer_id: Option<[u8; 20]>,
}

impl PeerEndpoint {
    /// Parse into a dialable address; `None` for hostnames
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Drop obviously undialable peers: unparseable IPs, port 0, loopback.
pub fn is_valid_peer(peer: &PeerEndpoint) -> bool {
    if peer.port == 0 {
        return false;
    }
    match peer.ip.parse::<std::net::IpAddr>() {
        Ok(ip) => !ip.is_loopback(),
        Err(_) => false,
    }
}

/// Tracker response
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic announce
    pub interval: u32,
    /// Optional lower bound the tracker asks us to respect
    pub min_interval: Option<u32>,
    /// Tracker session id, echoed on later announces by some trackers
    pub tracker_id: Option<String>,
    /// Seeders
    pub complete: Option<u32>,
    /// Leechers
    pub incomplete: Option<u32>,
    /// Human-readable warning; the announce still succeeded
    pub warning_message: Option<String>,
    /// Discovered peers
    pub peers: Vec<PeerEndpoint>,
}

/// Client for HTTP and UDP trackers. One instance per torrent run: the peer
/// id and the 32-bit key identify the session across announces.
pub struct TrackerClient {
    http: reqwest::Client,
    peer_id: [u8; 20],
    key: u32,
    timeout: Duration,
}

impl TrackerClient {
    /// Create a client with a fresh random peer id and session key
    pub fn new() -> Result<Self> {
        Self::with_peer_id(generate_peer_id())
    }

    /// Create a client with a specific peer id
    pub fn with_peer_id(peer_id: [u8; 20]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::Other,
                    format!("failed to build HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            http,
            peer_id,
            key: rand::rng().random(),
            timeout: TRACKER_TIMEOUT,
        })
    }

    /// Our peer id
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Announce to a single tracker, dispatching on the URL scheme.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = Url::parse(tracker_url)?;
        match url.scheme() {
            "http" | "https" => self.announce_http(tracker_url, request).await,
            "udp" => self.announce_udp(&url, request).await,
            scheme => Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("unsupported tracker scheme: {}", scheme),
            )),
        }
    }

    /// Walk the primary announce and announce-list tiers in order, returning
    /// the first successful response. Errors only when every URL failed.
    pub async fn announce_all(
        &self,
        trackers: &[String],
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut last_error = None;

        for tracker_url in trackers {
            match self.announce(tracker_url, request).await {
                Ok(response) => {
                    if let Some(ref warning) = response.warning_message {
                        tracing::warn!("tracker {} warned: {}", tracker_url, warning);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!("tracker {} failed: {}", tracker_url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("all {} trackers failed, last error: {}", trackers.len(), e),
            ),
            None => ClientError::protocol(ProtocolErrorKind::TrackerError, "no trackers to try"),
        })
    }

    /// HTTP/HTTPS announce: GET with URL-encoded query parameters, bencoded
    /// response body.
    async fn announce_http(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in &request.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &self.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str(&format!("&port={}", request.port));
        url.push_str("&uploaded=0");
        url.push_str(&format!("&downloaded={}", request.downloaded));
        url.push_str(&format!("&left={}", request.left));
        url.push_str("&compact=1");

        let event = request.event.as_http_str();
        if !event.is_empty() {
            url.push_str(&format!("&event={}", event));
        }

        url.push_str(&format!("&numwant={}", NUMWANT));
        url.push_str(&format!("&key={}", self.key));

        let response = self.http.get(&url).send().await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("tracker request failed: {}", e),
            )
        })?;

        if !response.status().is_success() {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("tracker returned status {}", response.status()),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("failed to read tracker response: {}", e),
            )
        })?;

        self.parse_http_response(&body)
    }

    fn parse_http_response(&self, body: &[u8]) -> Result<AnnounceResponse> {
        let value = bencode::decode(body).map_err(|_| {
            ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "tracker response is not valid bencode",
            )
        })?;
        let dict = value.as_dict().ok_or_else(|| {
            ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "tracker response must be a dictionary",
            )
        })?;

        if let Some(reason) = dict.get(b"failure reason".as_slice()) {
            let reason = reason
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_else(|| "(unreadable)".to_string());
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("tracker failure: {}", reason),
            ));
        }

        let interval = dict
            .get(b"interval".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::TrackerError,
                    "missing 'interval' in tracker response",
                )
            })? as u32;
        let interval = interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);

        let min_interval = dict
            .get(b"min interval".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| (v as u32).clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL));

        let tracker_id = dict
            .get(b"tracker id".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let complete = dict
            .get(b"complete".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| v as u32);

        let incomplete = dict
            .get(b"incomplete".as_slice())
            .and_then(|v| v.as_uint())
            .map(|v| v as u32);

        let warning_message = dict
            .get(b"warning message".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let peers = Self::parse_peers(dict.get(b"peers".as_slice()))?;

        Ok(AnnounceResponse {
            interval,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            warning_message,
            peers,
        })
    }

    /// Peers arrive either compact (6 bytes each: IPv4 + big-endian port)
    /// or as a list of dictionaries.
    fn parse_peers(value: Option<&BencodeValue>) -> Result<Vec<PeerEndpoint>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };

        match value {
            BencodeValue::Bytes(data) => {
                if data.len() % 6 != 0 {
                    return Err(ClientError::protocol(
                        ProtocolErrorKind::TrackerError,
                        format!("compact peers length {} is not a multiple of 6", data.len()),
                    ));
                }
                Ok(data.chunks_exact(6).map(compact_peer).collect())
            }

            BencodeValue::List(entries) => {
                let mut peers = Vec::with_capacity(entries.len());
                for entry in entries {
                    let dict = entry.as_dict().ok_or_else(|| {
                        ClientError::protocol(
                            ProtocolErrorKind::TrackerError,
                            "peer entry must be a dictionary",
                        )
                    })?;

                    let ip = dict
                        .get(b"ip".as_slice())
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            ClientError::protocol(
                                ProtocolErrorKind::TrackerError,
                                "peer entry missing 'ip'",
                            )
                        })?
                        .to_string();

                    let port = dict
                        .get(b"port".as_slice())
                        .and_then(|v| v.as_uint())
                        .ok_or_else(|| {
                            ClientError::protocol(
                                ProtocolErrorKind::TrackerError,
                                "peer entry missing 'port'",
                            )
                        })? as u16;

                    let peer_id = dict
                        .get(b"peer id".as_slice())
                        .and_then(|v| v.as_bytes())
                        .and_then(|b| <[u8; 20]>::try_from(b).ok());

                    peers.push(PeerEndpoint { ip, port, peer_id });
                }
                Ok(peers)
            }

            _ => Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "unrecognized peers encoding",
            )),
        }
    }

    /// UDP announce: connect handshake, then the 98-byte announce, both
    /// under the round-trip deadline.
    async fn announce_udp(
        &self,
        url: &Url,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let host = url.host_str().ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no host")
        })?;
        let port = url.port().ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no port")
        })?;

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("failed to resolve {}: {}", host, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                ClientError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("no addresses for {}", host),
                )
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("failed to bind UDP socket: {}", e),
            )
        })?;
        socket.connect(addr).await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("failed to connect UDP socket: {}", e),
            )
        })?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, request).await
    }

    /// Step 1: obtain a connection id.
    async fn udp_connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // action: connect
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        socket.send(&packet).await.map_err(|e| {
            ClientError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
        })?;

        let mut response = [0u8; 16];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "UDP connect timed out")
            })?
            .map_err(|e| {
                ClientError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 16 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP connect response is {} bytes, need 16", len),
            ));
        }

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let echoed = u32::from_be_bytes(response[4..8].try_into().unwrap());
        if action != 0 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP connect returned action {}", action),
            ));
        }
        if echoed != transaction_id {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP connect transaction id mismatch",
            ));
        }

        Ok(u64::from_be_bytes(response[8..16].try_into().unwrap()))
    }

    /// Step 2: the announce proper.
    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes()); // 0..8
        packet.extend_from_slice(&1u32.to_be_bytes()); // 8..12  action: announce
        packet.extend_from_slice(&transaction_id.to_be_bytes()); // 12..16
        packet.extend_from_slice(&request.info_hash); // 16..36
        packet.extend_from_slice(&self.peer_id); // 36..56
        packet.extend_from_slice(&request.downloaded.to_be_bytes()); // 56..64
        packet.extend_from_slice(&request.left.to_be_bytes()); // 64..72
        packet.extend_from_slice(&0u64.to_be_bytes()); // 72..80  uploaded
        packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes()); // 80..84
        packet.extend_from_slice(&0u32.to_be_bytes()); // 84..88  ip: default
        packet.extend_from_slice(&self.key.to_be_bytes()); // 88..92
        packet.extend_from_slice(&NUMWANT.to_be_bytes()); // 92..96
        packet.extend_from_slice(&request.port.to_be_bytes()); // 96..98

        socket.send(&packet).await.map_err(|e| {
            ClientError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
        })?;

        // 20-byte header plus 6 bytes per peer; 4 KiB covers far more peers
        // than we ever request.
        let mut response = [0u8; 4096];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "UDP announce timed out")
            })?
            .map_err(|e| {
                ClientError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 8 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce response is {} bytes", len),
            ));
        }

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let echoed = u32::from_be_bytes(response[4..8].try_into().unwrap());

        if action == 3 {
            // Error packet: message text follows the header
            let message = String::from_utf8_lossy(&response[8..len]).into_owned();
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP tracker error: {}", message),
            ));
        }
        if action != 1 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce returned action {}", action),
            ));
        }
        if len < 20 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce response is {} bytes, need 20", len),
            ));
        }
        if echoed != transaction_id {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce transaction id mismatch",
            ));
        }

        let interval = u32::from_be_bytes(response[8..12].try_into().unwrap())
            .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL);
        let leechers = u32::from_be_bytes(response[12..16].try_into().unwrap());
        let seeders = u32::from_be_bytes(response[16..20].try_into().unwrap());

        let peers = response[20..len].chunks_exact(6).map(compact_peer).collect();

        Ok(AnnounceResponse {
            interval,
            min_interval: None,
            tracker_id: None,
            complete: Some(seeders),
            incomplete: Some(leechers),
            warning_message: None,
            peers,
        })
    }
}

fn compact_peer(chunk: &[u8]) -> PeerEndpoint {
    PeerEndpoint {
        ip: format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]),
        port: u16::from_be_bytes([chunk[4], chunk[5]]),
        peer_id: None,
    }
}

/// Azureus-style peer id: `-SW0001-` and 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-SW0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_format() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-SW0001-");
    }

    #[test]
    fn test_event_mappings() {
        assert_eq!(AnnounceEvent::None.as_http_str(), "");
        assert_eq!(AnnounceEvent::Started.as_http_str(), "started");
        assert_eq!(AnnounceEvent::Stopped.as_http_str(), "stopped");
        assert_eq!(AnnounceEvent::Completed.as_http_str(), "completed");

        assert_eq!(AnnounceEvent::None.as_udp_id(), 0);
        assert_eq!(AnnounceEvent::Completed.as_udp_id(), 1);
        assert_eq!(AnnounceEvent::Started.as_udp_id(), 2);
        assert_eq!(AnnounceEvent::Stopped.as_udp_id(), 3);
    }

    #[test]
    fn test_parse_compact_peers() {
        let data = vec![
            127, 0, 0, 1, 0x1A, 0xE1, // 127.0.0.1:6881
            192, 168, 1, 1, 0x1A, 0xE2, // 192.168.1.1:6882
        ];
        let value = BencodeValue::Bytes(data);
        let peers = TrackerClient::parse_peers(Some(&value)).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, "127.0.0.1");
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, "192.168.1.1");
        assert_eq!(peers[1].port, 6882);

        // Not a multiple of 6
        let value = BencodeValue::Bytes(vec![1, 2, 3, 4, 5]);
        assert!(TrackerClient::parse_peers(Some(&value)).is_err());
    }

    #[test]
    fn test_parse_dictionary_response() {
        let client = TrackerClient::new().unwrap();

        let body = b"d8:completei3e10:incompletei7e8:intervali900e5:peersld2:ip9:10.0.0.204:porti6881eeee";
        let response = client.parse_http_response(body).unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(7));
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].ip, "10.0.0.20");
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn test_failure_reason() {
        let client = TrackerClient::new().unwrap();
        let err = client
            .parse_http_response(b"d14:failure reason12:torrent gonee")
            .unwrap_err();
        assert!(err.to_string().contains("torrent gone"));
    }

    #[test]
    fn test_interval_required_and_clamped() {
        let client = TrackerClient::new().unwrap();

        // Missing interval
        assert!(client.parse_http_response(b"d5:peers0:e").is_err());

        // Hyper-aggressive interval is clamped up
        let response = client
            .parse_http_response(b"d8:intervali5e5:peers0:e")
            .unwrap();
        assert_eq!(response.interval, MIN_ANNOUNCE_INTERVAL);
    }

    #[test]
    fn test_peer_validity_filter() {
        let ok = PeerEndpoint {
            ip: "93.184.216.34".into(),
            port: 6881,
            peer_id: None,
        };
        assert!(is_valid_peer(&ok));
        assert!(ok.socket_addr().is_some());

        let loopback = PeerEndpoint {
            ip: "127.0.0.1".into(),
            port: 6881,
            peer_id: None,
        };
        assert!(!is_valid_peer(&loopback));

        let zero_port = PeerEndpoint {
            ip: "93.184.216.34".into(),
            port: 0,
            peer_id: None,
        };
        assert!(!is_valid_peer(&zero_port));

        let hostname = PeerEndpoint {
            ip: "peer.example.com".into(),
            port: 6881,
            peer_id: None,
        };
        assert!(!is_valid_peer(&hostname));
        assert!(hostname.socket_addr().is_none());
    }
}
