//! Store configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lock timing shared by every store opened with this config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a writer waits for the file lock (or SQLite write lock)
    /// before failing with a concurrency error
    pub lock_timeout: Duration,
    /// Sleep between lock attempts
    pub lock_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(250),
            lock_poll_interval: Duration::from_millis(10),
        }
    }
}

impl StoreConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
