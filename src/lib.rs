//! # swarm-dl
//!
//! A leech-only BitTorrent client engine: it loads a `.torrent` file,
//! discovers peers through HTTP and UDP trackers, maintains a bounded set
//! of concurrent peer-wire sessions, and assembles SHA-1-verified pieces
//! into local files. It never serves blocks, never joins the DHT, and exits
//! once the content verifies.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use swarm_dl::{ClientConfig, Metainfo, SwarmDownloader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("linux.iso.torrent")?;
//!     let metainfo = Metainfo::parse(&data)?;
//!
//!     let swarm = SwarmDownloader::new(metainfo, ClientConfig::default())?;
//!     let complete = swarm.run().await?;
//!     println!("finished, complete: {}", complete);
//!     Ok(())
//! }
//! ```

pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod strategy;
pub mod swarm;
pub mod tracker;

// Re-exports for convenience
pub use bencode::BencodeValue;
pub use bitfield::Bitfield;
pub use config::{ClientConfig, StrategyKind};
pub use error::{
    ClientError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use metainfo::{FileEntry, FileMode, Info, Metainfo, Sha1Hash};
pub use peer::{PeerConnection, PeerMessage, MAX_MESSAGE_SIZE};
pub use piece::{BlockOutcome, BlockRequest, PieceManager, Progress, BLOCK_SIZE};
pub use storage::FileStorage;
pub use strategy::{PieceStrategy, RandomStrategy, RarestFirstStrategy};
pub use swarm::{SwarmDownloader, SwarmStatus};
pub use tracker::{
    generate_peer_id, AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerEndpoint,
    TrackerClient,
};
