//! Peer wire protocol
//!
//! Handshake, framed message codec, and per-connection state for one remote
//! peer. After the 68-byte handshake the stream carries length-prefixed
//! messages: a 4-byte big-endian length, zero for keep-alive, otherwise a
//! tag byte and payload. Frames are parsed out of an accumulation buffer so
//! a timed-out or cancelled read never desyncs the stream.
//!
//! This client is leech-only: incoming `request` and `cancel` are parsed and
//! dropped, `port` is ignored, and unknown tags are consumed.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::bitfield::Bitfield;
use crate::error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::metainfo::Sha1Hash;

/// Protocol identifier carried in every handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// pstrlen + pstr + reserved + info hash + peer id
const HANDSHAKE_SIZE: usize = 68;

/// Frames larger than this are a protocol violation (128 KiB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Write deadline for outgoing messages
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame; refreshes activity only
    KeepAlive,
    /// Peer will not serve our requests
    Choke,
    /// Peer will serve our requests
    Unchoke,
    /// Peer wants our pieces
    Interested,
    /// Peer no longer wants our pieces
    NotInterested,
    /// Peer acquired one piece
    Have { index: u32 },
    /// Peer's full availability, MSB-first
    Bitfield { bytes: Vec<u8> },
    /// Block request (ignored: leech-only)
    Request { index: u32, begin: u32, length: u32 },
    /// Block payload
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Request withdrawal (ignored: leech-only)
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT port advertisement (ignored)
    Port { port: u16 },
    /// Unrecognized tag, consumed and dropped
    Unknown { tag: u8 },
}

impl PeerMessage {
    /// Wire tag, `None` for keep-alive
    pub fn tag(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel { .. } => Some(8),
            Self::Port { .. } => Some(9),
            Self::Unknown { tag } => Some(*tag),
        }
    }

    /// Encode with the 4-byte length prefix
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],
            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }
            Self::Bitfield { bytes } => {
                let len = 1 + bytes.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bytes);
                buf
            }
            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
            Self::Port { port } => {
                let mut buf = vec![0, 0, 0, 3, 9];
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Self::Unknown { tag } => vec![0, 0, 0, 1, *tag],
        }
    }

    /// Decode a frame body (length prefix already stripped). An empty body
    /// is a keep-alive.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let tag = body[0];
        let payload = &body[1..];

        let short = |name: &str| {
            ClientError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("{} message has {} payload bytes", name, payload.len()),
            )
        };

        match tag {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => {
                if payload.len() != 4 {
                    return Err(short("have"));
                }
                Ok(Self::Have {
                    index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                })
            }
            5 => Ok(Self::Bitfield {
                bytes: payload.to_vec(),
            }),
            6 => {
                if payload.len() != 12 {
                    return Err(short("request"));
                }
                Ok(Self::Request {
                    index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    length: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(short("piece"));
                }
                Ok(Self::Piece {
                    index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                if payload.len() != 12 {
                    return Err(short("cancel"));
                }
                Ok(Self::Cancel {
                    index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    length: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                })
            }
            9 => {
                if payload.len() != 2 {
                    return Err(short("port"));
                }
                Ok(Self::Port {
                    port: u16::from_be_bytes(payload[0..2].try_into().unwrap()),
                })
            }
            tag => Ok(Self::Unknown { tag }),
        }
    }
}

/// Connection to one remote peer, post-handshake
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    remote_peer_id: [u8; 20],
    num_pieces: usize,

    // Protocol state, wire defaults
    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,

    peer_pieces: Bitfield,
    downloaded: u64,
    last_activity: Instant,
    last_receive: Instant,
    read_buffer: BytesMut,
}

impl PeerConnection {
    /// Dial a peer and run the handshake. Fails on dial timeout, handshake
    /// deadline, malformed handshake, or info-hash mismatch; in every
    /// failure case the socket is dropped without reading further.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        num_pieces: usize,
        dial_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "dial timed out"))?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("failed to connect to {}: {}", addr, e),
                )
            })?;

        let mut conn = Self {
            stream,
            addr,
            remote_peer_id: [0u8; 20],
            num_pieces,
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            peer_pieces: Bitfield::new(num_pieces),
            downloaded: 0,
            last_activity: Instant::now(),
            last_receive: Instant::now(),
            read_buffer: BytesMut::with_capacity(32 * 1024),
        };
        conn.handshake(info_hash, peer_id, handshake_timeout).await?;
        Ok(conn)
    }

    async fn handshake(
        &mut self,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        deadline: Duration,
    ) -> Result<()> {
        let mut ours = Vec::with_capacity(HANDSHAKE_SIZE);
        ours.push(PROTOCOL_STRING.len() as u8);
        ours.extend_from_slice(PROTOCOL_STRING);
        ours.extend_from_slice(&[0u8; 8]);
        ours.extend_from_slice(&info_hash);
        ours.extend_from_slice(&peer_id);

        timeout(deadline, self.stream.write_all(&ours))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "handshake send timed out")
            })?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake send failed: {}", e),
                )
            })?;

        let mut theirs = [0u8; HANDSHAKE_SIZE];
        timeout(deadline, self.stream.read_exact(&mut theirs))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "handshake receive timed out")
            })?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("handshake receive failed: {}", e),
                )
            })?;

        if theirs[0] as usize != PROTOCOL_STRING.len()
            || &theirs[1..1 + PROTOCOL_STRING.len()] != PROTOCOL_STRING
        {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "invalid protocol string in handshake",
            ));
        }

        // Bytes 20..28 are the reserved extension bits; nothing here uses them.
        if theirs[28..48] != info_hash {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerProtocol,
                "handshake info hash mismatch",
            ));
        }

        self.remote_peer_id.copy_from_slice(&theirs[48..68]);
        self.last_activity = Instant::now();
        self.last_receive = Instant::now();
        Ok(())
    }

    /// Receive one message, assembling frames from the accumulation buffer.
    /// Cancel-safe: dropping the future mid-read leaves partial bytes in the
    /// buffer for the next call.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        loop {
            if let Some(body) = self.extract_frame()? {
                let msg = PeerMessage::decode(&body)?;
                self.apply(&msg);
                self.last_activity = Instant::now();
                self.last_receive = Instant::now();
                return Ok(msg);
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| {
                    ClientError::network(
                        NetworkErrorKind::ConnectionReset,
                        format!("read failed: {}", e),
                    )
                })?;
            if n == 0 {
                return Err(ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    "peer closed the connection",
                ));
            }
        }
    }

    /// [`recv`](Self::recv) with a deadline on the whole message.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<PeerMessage> {
        timeout(deadline, self.recv())
            .await
            .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "message read timed out"))?
    }

    /// Pull one complete frame body out of the buffer, if present.
    fn extract_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_buffer.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(self.read_buffer[0..4].try_into().unwrap()) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("message of {} bytes exceeds {} byte cap", len, MAX_MESSAGE_SIZE),
            ));
        }
        if self.read_buffer.len() < 4 + len {
            self.read_buffer.reserve(4 + len - self.read_buffer.len());
            return Ok(None);
        }

        self.read_buffer.advance(4);
        Ok(Some(self.read_buffer.split_to(len).to_vec()))
    }

    /// Send one message with the write deadline applied.
    pub async fn send(&mut self, msg: PeerMessage) -> Result<()> {
        let data = msg.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "send timed out"))?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("send failed: {}", e),
                )
            })?;

        match msg {
            PeerMessage::Interested => self.am_interested = true,
            PeerMessage::NotInterested => self.am_interested = false,
            PeerMessage::Choke => self.peer_choked = true,
            PeerMessage::Unchoke => self.peer_choked = false,
            _ => {}
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Update local state from an incoming message.
    fn apply(&mut self, msg: &PeerMessage) {
        match msg {
            PeerMessage::Choke => self.am_choked = true,
            PeerMessage::Unchoke => self.am_choked = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { index } => {
                // An index past the current bitfield grows it with zeros.
                let index = *index as usize;
                self.peer_pieces.grow_to(index + 1);
                let _ = self.peer_pieces.set(index);
            }
            PeerMessage::Bitfield { bytes } => {
                // Wholesale replacement; padding bits past num_pieces are
                // dropped, short payloads read as zeros.
                self.peer_pieces = Bitfield::from_bytes(bytes, self.num_pieces);
            }
            PeerMessage::Piece { block, .. } => {
                self.downloaded += block.len() as u64;
            }
            _ => {}
        }
    }

    // Accessors

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    /// Is the peer choking us?
    pub fn am_choked(&self) -> bool {
        self.am_choked
    }

    /// Have we declared interest?
    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    /// Is the peer interested in us?
    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Are we choking the peer? Always true for this client: it never
    /// serves blocks, so it never unchokes anyone.
    pub fn peer_choked(&self) -> bool {
        self.peer_choked
    }

    /// The peer's advertised availability
    pub fn peer_pieces(&self) -> &Bitfield {
        &self.peer_pieces
    }

    pub fn peer_has_piece(&self, index: u32) -> bool {
        self.peer_pieces.has(index as usize)
    }

    /// Bytes of block payload received on this connection
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Time since any activity in either direction
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Time since the last message arrived from the peer. Our own
    /// keep-alives do not reset this clock, so the inactivity cutoff can
    /// actually fire.
    pub fn receive_idle_time(&self) -> Duration {
        self.last_receive.elapsed()
    }
}
