//! # Node Configuration
//!
//! Every tunable of a node in one serde struct, loadable from TOML. Absent
//! keys fall back to the `DEFAULT_*` constants below. The only setting with
//! no usable default is `advertise`, needed whenever `listen` is a wildcard.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Protocol version stamped on outbound messages.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum peers per distance band.
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Random peers pinged per liveness round.
pub const DEFAULT_PING_NODE_NUM: usize = 20;

/// Peers requested per FindNode.
pub const DEFAULT_FIND_NODE_NUM: usize = 8;

/// Upper bound on peers returned for one FindNode, whatever the requester asks.
pub const DEFAULT_FIND_NODE_MAX_RESPONSE: usize = 16;

/// Width of the closest-peer search behind KV custodianship.
pub const DEFAULT_NODE_RESPONSE_NUMBER: usize = 8;

/// Random peers a gossip message is re-broadcast to.
pub const DEFAULT_NODE_BROADCAST_NUMBER: usize = 16;

/// Closer peers needed before a node stops treating itself as a custodian.
pub const DEFAULT_NODE_PARTITION_NUMBER: usize = 8;

/// Below this table size bootstrap queries every known peer.
pub const DEFAULT_MIN_NODE_SIZE: usize = 100;

/// Below this table size bootstrap queries one peer per bucket.
pub const DEFAULT_MAX_NODE_SIZE: usize = 2000;

/// Receive buffer, and the largest partial record carried between datagrams.
pub const DEFAULT_MAX_BUF_LEN: usize = 16 * 1024;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_FIND_NODE_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_BACKUP_INTERVAL_SECS: u64 = 10 * 60;

/// How long a message ID suppresses re-dispatch.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_DEDUP_CAPACITY: usize = 65_536;

/// Length of the inbound and outbound queues.
pub const DEFAULT_QUEUE_LEN: usize = 2000;
pub const DEFAULT_ID_POOL_SIZE: usize = 256;

pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org:123";
pub const DEFAULT_NTP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_NTP_CHECKS: usize = 3;
pub const DEFAULT_NTP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DRIFT_THRESHOLD_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: SocketAddr,
    /// Address other peers should use for this node. Required when `listen`
    /// is a wildcard address.
    pub advertise: Option<SocketAddr>,
    /// Hex node ID. Generated and persisted when absent.
    pub node_id: Option<String>,
    /// Peer URLs contacted at startup. Malformed entries abort startup.
    pub seeds: Vec<String>,
    /// Sled database directory. In-memory storage when absent.
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    pub protocol_version: String,

    pub bucket_size: usize,
    pub ping_node_num: usize,
    pub find_node_num: usize,
    pub find_node_max_response: usize,
    pub node_response_number: usize,
    pub node_broadcast_number: usize,
    pub node_partition_number: usize,
    pub min_node_size: usize,
    pub max_node_size: usize,

    pub max_buf_len: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub find_node_interval_secs: u64,
    pub backup_interval_secs: u64,
    pub dedup_ttl_secs: u64,
    pub dedup_capacity: usize,
    pub queue_len: usize,
    pub id_pool_size: usize,

    pub ntp: NtpConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NtpConfig {
    pub enabled: bool,
    pub server: String,
    pub interval_secs: u64,
    pub checks: usize,
    pub timeout_secs: u64,
    pub drift_threshold_ms: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: DEFAULT_NTP_SERVER.to_string(),
            interval_secs: DEFAULT_NTP_INTERVAL_SECS,
            checks: DEFAULT_NTP_CHECKS,
            timeout_secs: DEFAULT_NTP_TIMEOUT_SECS,
            drift_threshold_ms: DEFAULT_DRIFT_THRESHOLD_MS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            advertise: None,
            node_id: None,
            seeds: Vec::new(),
            data_dir: None,
            log_level: "info".to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            ping_node_num: DEFAULT_PING_NODE_NUM,
            find_node_num: DEFAULT_FIND_NODE_NUM,
            find_node_max_response: DEFAULT_FIND_NODE_MAX_RESPONSE,
            node_response_number: DEFAULT_NODE_RESPONSE_NUMBER,
            node_broadcast_number: DEFAULT_NODE_BROADCAST_NUMBER,
            node_partition_number: DEFAULT_NODE_PARTITION_NUMBER,
            min_node_size: DEFAULT_MIN_NODE_SIZE,
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            max_buf_len: DEFAULT_MAX_BUF_LEN,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            find_node_interval_secs: DEFAULT_FIND_NODE_INTERVAL_SECS,
            backup_interval_secs: DEFAULT_BACKUP_INTERVAL_SECS,
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            queue_len: DEFAULT_QUEUE_LEN,
            id_pool_size: DEFAULT_ID_POOL_SIZE,
            ntp: NtpConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML file. Call [`Config::validate`] once overrides are applied.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("bucket_size", self.bucket_size),
            ("find_node_max_response", self.find_node_max_response),
            ("node_response_number", self.node_response_number),
            ("node_partition_number", self.node_partition_number),
            ("max_buf_len", self.max_buf_len),
            ("queue_len", self.queue_len),
            ("id_pool_size", self.id_pool_size),
            ("dedup_capacity", self.dedup_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        let periods = [
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("find_node_interval_secs", self.find_node_interval_secs),
            ("backup_interval_secs", self.backup_interval_secs),
            ("ntp.interval_secs", self.ntp.interval_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1 second")));
            }
        }
        if self.min_node_size > self.max_node_size {
            return Err(ConfigError::Invalid(format!(
                "min_node_size ({}) exceeds max_node_size ({})",
                self.min_node_size, self.max_node_size
            )));
        }
        if self.node_partition_number > self.node_response_number {
            return Err(ConfigError::Invalid(format!(
                "node_partition_number ({}) exceeds node_response_number ({})",
                self.node_partition_number, self.node_response_number
            )));
        }
        if self.listen.ip().is_unspecified() && self.advertise.is_none() {
            return Err(ConfigError::Invalid(
                "advertise address required when listening on a wildcard address".into(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn find_node_interval(&self) -> Duration {
        Duration::from_secs(self.find_node_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn ntp_interval(&self) -> Duration {
        Duration::from_secs(self.ntp.interval_secs)
    }

    /// A configuration bound to an ephemeral loopback port with no clock checks.
    pub fn loopback() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ntp: NtpConfig {
                enabled: false,
                ..NtpConfig::default()
            },
            ..Self::default()
        }
    }
}
