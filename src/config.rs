//! Client configuration
//!
//! Knobs for one download run. The defaults mirror the protocol's
//! conventional values: 50 peers, a pipeline of 10 requests per peer, and
//! the standard handshake/read/keep-alive deadlines.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Piece selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Prefer pieces advertised by the fewest known peers
    #[default]
    RarestFirst,
    /// Uniform random choice
    Random,
}

/// Configuration for a download run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory the content is written into
    pub output_dir: PathBuf,

    /// Port reported to trackers (leech-only: nothing listens on it unless
    /// the embedder does)
    pub listen_port: u16,

    /// Maximum concurrent peer sessions
    pub max_peers: usize,

    /// Maximum in-flight block requests per peer
    pub pipeline_depth: usize,

    /// Hash-scan existing files before contacting any tracker
    pub resume_scan: bool,

    /// Piece selection policy
    pub strategy: StrategyKind,

    /// Initial TCP dial deadline
    pub dial_timeout: Duration,

    /// Handshake read/write deadline
    pub handshake_timeout: Duration,

    /// Per-message read deadline
    pub message_timeout: Duration,

    /// Keep-alive send cadence
    pub keepalive_interval: Duration,

    /// Close a session after this long with no activity either direction
    pub inactivity_limit: Duration,

    /// Re-announce cadence used if a periodic announce fails before
    /// yielding a tracker interval
    pub announce_fallback_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            listen_port: 6881,
            max_peers: 50,
            pipeline_depth: 10,
            resume_scan: true,
            strategy: StrategyKind::default(),
            dial_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            inactivity_limit: Duration::from_secs(180),
            announce_fallback_interval: Duration::from_secs(1800),
        }
    }
}

impl ClientConfig {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(ClientError::invalid_input(
                "max_peers",
                "must be at least 1",
            ));
        }
        if self.pipeline_depth == 0 {
            return Err(ClientError::invalid_input(
                "pipeline_depth",
                "must be at least 1",
            ));
        }
        if self.listen_port == 0 {
            return Err(ClientError::invalid_input(
                "listen_port",
                "port 0 cannot be announced",
            ));
        }
        if self.inactivity_limit < self.keepalive_interval {
            return Err(ClientError::invalid_input(
                "inactivity_limit",
                "must not be shorter than keepalive_interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.pipeline_depth, 10);
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.strategy, StrategyKind::RarestFirst);
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = ClientConfig::default();
        config.max_peers = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.pipeline_depth = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inactivity_shorter_than_keepalive_rejected() {
        let mut config = ClientConfig::default();
        config.inactivity_limit = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
