//! Immutable tunables for the cube store and its gossip protocol.
//!
//! Grounded on the teacher's `net/types.rs`: a single constants module plus
//! a `Settings` struct that can be overlaid from a config file, rather than
//! module-level mutable globals (spec §9: "Global mutable singletons").

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Total encoded size of a block (§3.1, I1).
pub const BLOCK_SIZE: usize = 1024;

/// Bytes consumed by the fixed header (version/reserved + date), before TLV fields begin.
pub const HEADER_SIZE: usize = 6;

/// Proof-of-work difficulty required for a block to be admitted (§3.1 I3).
pub const REQUIRED_DIFFICULTY: u32 = 12;

/// Maximum identities carried in one `HashResponse`/`BlockRequest` message (§6.2).
pub const MAX_HASH_COUNT: usize = 1000;

/// Size of a block identity hash, in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of the process-scoped node identifier exchanged in `Hello` (§6.3).
pub const PEER_ID_SIZE: usize = 16;

/// Number of attempts the miner performs before yielding to the scheduler (§4.2 Mining).
pub const MINING_YIELD_BATCH: u64 = 1000;

/// Protocol version; only 0 is accepted (§3.1 I7).
pub const PROTOCOL_VERSION: u8 = 0;

/// Runtime configuration, loaded once at startup and shared immutably
/// (`Arc<Settings>`) across every component — no module-level statics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hashcash difficulty (trailing zero bits) required for admission.
    pub required_difficulty: u32,
    /// How often a non-light session sends an unsolicited `HashRequest`.
    pub hash_request_interval_secs: u64,
    /// How often `PeerDB` announces known peers to connected sessions.
    pub announcement_interval_secs: u64,
    /// Maximum simultaneous connections the `NetworkManager` maintains.
    pub max_connections: usize,
    /// Outbound dial handshake timeout.
    pub handshake_timeout_ms: u64,
    /// Whether this node listens for inbound connections (false = light client).
    pub listen: bool,
    /// Local listen port, when `listen` is true.
    pub listen_port: u16,
    /// Block-lifetime calibration: (difficulty, lifetime_days) anchor 1.
    pub lifetime_d1: f64,
    pub lifetime_c1: f64,
    /// Block-lifetime calibration: (difficulty, lifetime_days) anchor 2.
    pub lifetime_d2: f64,
    pub lifetime_c2: f64,
    /// Added to the lifetime formula's output (§4.2).
    pub lifetime_constant: f64,
    /// How often the store scans for expired blocks.
    pub eviction_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            required_difficulty: REQUIRED_DIFFICULTY,
            hash_request_interval_secs: 10,
            announcement_interval_secs: 25 * 60,
            max_connections: 20,
            handshake_timeout_ms: 2500,
            listen: true,
            listen_port: 32100,
            lifetime_d1: 30.0,
            lifetime_c1: 12.0,
            lifetime_d2: 365.0,
            lifetime_c2: 20.0,
            lifetime_constant: 0.0,
            eviction_interval_secs: 3600,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for any
    /// field the file omits (`#[serde(default)]` on the struct).
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&text).map_err(ConfigError::Parse)
    }

    pub fn hash_request_interval(&self) -> Duration {
        Duration::from_secs(self.hash_request_interval_secs)
    }

    pub fn announcement_interval(&self) -> Duration {
        Duration::from_secs(self.announcement_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(toml::de::Error),
}
