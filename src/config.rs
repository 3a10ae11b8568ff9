//! Session configuration
//!
//! Knobs for a single scheduling session. Everything here is supplied by
//! the host adapter; the core has no environment or file handling of its
//! own.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one test session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Global worker-pool size. Named parallel groups may cap further,
    /// never expand.
    pub parallelism: usize,

    /// Timeout applied to tests that do not declare their own.
    pub default_timeout_secs: u64,

    /// How long running tests get to finish their After-chain and release
    /// fixtures once cancellation fires, before being abandoned.
    pub cancellation_grace_ms: u64,

    /// Trip the session's own cancellation on the first failed test.
    pub fail_fast: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            default_timeout_secs: 300, // 5 minutes
            cancellation_grace_ms: 5_000,
            fail_fast: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_cancellation_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }
}
