//! Core types shared by every fitbridge crate
//!
//! Identifiers and time sources, using newtype patterns for semantic
//! validation the same way across the workspace.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::FitError;

// ----------------------------------------------------------------------------
// Manager Identifier
// ----------------------------------------------------------------------------

/// Length of every manager / correlation uid on the wire
pub const UID_LEN: usize = 16;

/// 16-character identifier keying device managers and in-flight requests
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Generate a fresh random uid
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..UID_LEN].to_string())
    }

    /// Get the uid as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a string has the shape of a uid
    pub fn is_uid(s: &str) -> bool {
        s.len() == UID_LEN && s.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uid {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_uid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(FitError::invalid_field("uid", format!("{s:?} is not a 16-character uid")))
        }
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Provides millisecond timestamps to derivators and managers
///
/// The service uses the wall clock; tests drive a [`MockTimeSource`].
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Mock time source for deterministic testing
///
/// Clones share the same clock, so a test can hand one copy to the code under
/// test and advance another.
#[derive(Debug, Clone, Default)]
pub struct MockTimeSource {
    current: Arc<AtomicI64>,
}

impl MockTimeSource {
    /// Create a mock clock starting at `start_ms`
    pub fn new_at(start_ms: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Advance time by the specified number of milliseconds
    pub fn advance(&self, millis: i64) {
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the time to a specific value
    pub fn set_time(&self, millis: i64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now_ms(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}
