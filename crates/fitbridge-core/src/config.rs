//! Centralized Configuration Management
//!
//! This module consolidates the configuration structures used by the backend
//! service, the BLE driver endpoint and the control client. Every section has
//! sensible defaults so a missing TOML table falls back cleanly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Database Configuration
// ----------------------------------------------------------------------------

/// Location of the embedded SQL store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fitbridge.db"),
        }
    }
}

// ----------------------------------------------------------------------------
// OSC Hop Configuration
// ----------------------------------------------------------------------------

/// Which side of a hop sends keepalive pings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// Send a ping every interval; the peer is always considered live
    Sender,
    /// Expect pings; hold outbound traffic while they stop arriving
    Receiver,
}

/// One OSC hop between two processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    /// Local address to receive on
    pub bind: SocketAddr,
    /// Peer address to send to
    pub peer: SocketAddr,
    /// Keepalive role on this hop
    pub liveness: LivenessMode,
    /// Interval between pings in sender mode
    pub ping_interval_ms: u64,
    /// Silence after which the peer is considered down in receiver mode
    pub ping_timeout_ms: u64,
    /// Default deadline for a command awaiting a confirm
    pub command_timeout_ms: u64,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9002)),
            peer: SocketAddr::from(([127, 0, 0, 1], 9003)),
            liveness: LivenessMode::Receiver,
            ping_interval_ms: 2900,
            ping_timeout_ms: 6000,
            command_timeout_ms: 5000,
        }
    }
}

impl OscConfig {
    /// Create a hop between two addresses
    pub fn new(bind: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            bind,
            peer,
            ..Self::default()
        }
    }

    /// Swap the two ends, producing the configuration of the other process
    pub fn mirrored(&self) -> Self {
        Self {
            bind: self.peer,
            peer: self.bind,
            liveness: match self.liveness {
                LivenessMode::Sender => LivenessMode::Receiver,
                LivenessMode::Receiver => LivenessMode::Sender,
            },
            ..self.clone()
        }
    }

    /// Set the keepalive role
    pub fn with_liveness(mut self, liveness: LivenessMode) -> Self {
        self.liveness = liveness;
        self
    }

    /// Set the ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the ping timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Fleet Configuration
// ----------------------------------------------------------------------------

/// Retry policy of the fleet coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Connect attempts per device before giving up
    pub connect_retry: u32,
    /// Spacing between connect attempts
    pub connect_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            connect_retry: 10,
            connect_secs: 5,
        }
    }
}

impl FleetConfig {
    pub fn with_connect_retry(mut self, retry: u32) -> Self {
        self.connect_retry = retry;
        self
    }

    pub fn with_connect_secs(mut self, secs: u64) -> Self {
        self.connect_secs = secs;
        self
    }
}

// ----------------------------------------------------------------------------
// Derivator Configuration
// ----------------------------------------------------------------------------

/// Tuning of the per-device derivators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivatorConfig {
    /// Ring buffer length for the Keiser speed window
    pub buffer_size: usize,
    /// Gap between samples that ends an active span
    pub pause_threshold_ms: i64,
    /// Minimum spacing of coalesced commits
    pub commit_interval_ms: i64,
    /// Repeated broadcast times that put a Keiser bike in pause
    pub keiser_equal_time_limit: u32,
}

impl Default for DerivatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 150,
            pause_threshold_ms: 10_000,
            commit_interval_ms: 10_000,
            keiser_equal_time_limit: 8,
        }
    }
}

impl DerivatorConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_pause_threshold_ms(mut self, ms: i64) -> Self {
        self.pause_threshold_ms = ms;
        self
    }

    pub fn with_commit_interval_ms(mut self, ms: i64) -> Self {
        self.commit_interval_ms = ms;
        self
    }
}

// ----------------------------------------------------------------------------
// Timeout Configuration
// ----------------------------------------------------------------------------

/// Device manager timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Scan window while looking for a GATT device to connect
    pub connect_scan_secs: u64,
    /// Period of the Keiser scan restart
    pub keiser_rescan_secs: u64,
    /// Advertisement silence that disconnects a Keiser bike
    pub keiser_silence_secs: u64,
    /// Notification silence that disconnects a GATT device
    pub gatt_idle_secs: u64,
    /// Wait for the driver to confirm a disconnect
    pub disconnect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_scan_secs: 30,
            keiser_rescan_secs: 120,
            keiser_silence_secs: 5,
            gatt_idle_secs: 10,
            disconnect_secs: 5,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub database: DatabaseConfig,
    /// Hop between the control client and the backend service
    pub frontend: OscConfig,
    /// Hop between the backend and a split BLE driver process
    pub driver: Option<OscConfig>,
    pub fleet: FleetConfig,
    pub derivator: DerivatorConfig,
    pub timeouts: TimeoutConfig,
}

impl FitConfig {
    /// Set the database path
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = path.into();
        self
    }

    /// Set the frontend hop
    pub fn with_frontend(mut self, frontend: OscConfig) -> Self {
        self.frontend = frontend;
        self
    }

    /// Route BLE through a remote driver process
    pub fn with_driver(mut self, driver: OscConfig) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    pub fn with_derivator(mut self, derivator: DerivatorConfig) -> Self {
        self.derivator = derivator;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FitConfig::default();
        assert_eq!(config.fleet.connect_retry, 10);
        assert_eq!(config.fleet.connect_secs, 5);
        assert_eq!(config.derivator.buffer_size, 150);
        assert_eq!(config.frontend.ping_interval_ms, 2900);
        assert_eq!(config.frontend.ping_timeout_ms, 6000);
        assert_eq!(config.timeouts.keiser_rescan_secs, 120);
        assert!(config.driver.is_none());
    }

    #[test]
    fn mirrored_hop_swaps_roles() {
        let hop = OscConfig::default().with_liveness(LivenessMode::Sender);
        let other = hop.mirrored();
        assert_eq!(other.bind, hop.peer);
        assert_eq!(other.peer, hop.bind);
        assert_eq!(other.liveness, LivenessMode::Receiver);
    }

    #[test]
    fn buffer_size_never_zero() {
        let derivator = DerivatorConfig::default().with_buffer_size(0);
        assert_eq!(derivator.buffer_size, 1);
    }
}
