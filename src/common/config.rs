//! Configuration for meshkv peers
//!
//! Every parameter is fixed once a peer is constructed. Values come from
//! defaults, then an optional TOML file, then `MESHKV_*` environment
//! variables; the binary applies CLI flags last.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Room in a packet for the Raft message around its entries: the message
/// header plus per-entry framing
pub const RAFT_ENVELOPE_BYTES: usize = 1024;

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Raft logical clock interval
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Ticks before a follower starts an election
    #[serde(default = "default_election_ticks")]
    pub election_ticks: usize,

    /// Ticks between leader heartbeats
    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: usize,

    /// Cap on the byte size of entries carried by one append message
    #[serde(default = "default_max_size_per_msg")]
    pub max_size_per_msg: u64,

    /// Per-peer inflight append messages
    #[serde(default = "default_max_inflight_msgs")]
    pub max_inflight_msgs: usize,

    /// Largest marshaled client request accepted at the RPC boundary
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Largest datagram sent or read by the transport. Must leave
    /// [`RAFT_ENVELOPE_BYTES`] over the larger of `max_request_bytes` and
    /// `max_size_per_msg`, or a full-size entry can never be replicated.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,

    /// Cluster quorum floor; also the bootstrap threshold
    #[serde(default = "default_min_peer_count")]
    pub min_peer_count: usize,

    /// Mesh peer scan interval
    #[serde(default = "default_membership_poll")]
    pub membership_poll_ms: u64,

    /// Re-proposal interval for pending adds and removes
    #[serde(default = "default_conf_change_retry")]
    pub conf_change_retry_ms: u64,

    /// Capacity of the unreachable-peer channel
    #[serde(default = "default_unreachable_buffer")]
    pub unreachable_buffer: usize,

    /// Deadline applied to every client request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Store backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Rocksdb,
}

fn default_tick_interval() -> u64 {
    100
}
fn default_election_ticks() -> usize {
    10
}
fn default_heartbeat_ticks() -> usize {
    1
}
fn default_max_size_per_msg() -> u64 {
    4096
}
fn default_max_inflight_msgs() -> usize {
    256
}
fn default_max_request_bytes() -> usize {
    8192
}
fn default_max_packet_bytes() -> usize {
    default_max_request_bytes().max(default_max_size_per_msg() as usize) + RAFT_ENVELOPE_BYTES
}
fn default_min_peer_count() -> usize {
    1
}
fn default_membership_poll() -> u64 {
    1000
}
fn default_conf_change_retry() -> u64 {
    1000
}
fn default_unreachable_buffer() -> usize {
    10_000
}
fn default_request_timeout() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            election_ticks: default_election_ticks(),
            heartbeat_ticks: default_heartbeat_ticks(),
            max_size_per_msg: default_max_size_per_msg(),
            max_inflight_msgs: default_max_inflight_msgs(),
            max_request_bytes: default_max_request_bytes(),
            max_packet_bytes: default_max_packet_bytes(),
            min_peer_count: default_min_peer_count(),
            membership_poll_ms: default_membership_poll(),
            conf_change_retry_ms: default_conf_change_retry(),
            unreachable_buffer: default_unreachable_buffer(),
            request_timeout_ms: default_request_timeout(),
            backend: BackendKind::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("MESHKV"))
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig("tick interval must be > 0".into()));
        }
        if self.heartbeat_ticks == 0 || self.heartbeat_ticks >= self.election_ticks {
            return Err(crate::Error::InvalidConfig(format!(
                "heartbeat ticks ({}) must be in 1..election ticks ({})",
                self.heartbeat_ticks, self.election_ticks
            )));
        }
        if self.min_peer_count == 0 {
            return Err(crate::Error::InvalidConfig("min peer count must be > 0".into()));
        }
        let payload = self.max_request_bytes.max(self.max_size_per_msg as usize);
        if self.max_packet_bytes < payload.saturating_add(RAFT_ENVELOPE_BYTES) {
            return Err(crate::Error::InvalidConfig(format!(
                "max packet bytes ({}) must exceed the largest entry payload ({}) by {}",
                self.max_packet_bytes, payload, RAFT_ENVELOPE_BYTES
            )));
        }
        if self.unreachable_buffer == 0 {
            return Err(crate::Error::InvalidConfig("unreachable buffer must be > 0".into()));
        }
        if self.membership_poll_ms == 0 || self.conf_change_retry_ms == 0 {
            return Err(crate::Error::InvalidConfig("poll intervals must be > 0".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn membership_poll(&self) -> Duration {
        Duration::from_millis(self.membership_poll_ms)
    }

    pub fn conf_change_retry(&self) -> Duration {
        Duration::from_millis(self.conf_change_retry_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
