//! Bounded polling for external resources that become ready asynchronously.

use crate::config::Config;
use crate::error::Kube2Error;
use anyhow::Result;
use std::thread;
use std::time::Duration;

/// Polls a readiness check at a fixed interval, giving up after
/// `max_attempts` checks.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoll {
    interval: Duration,
    max_attempts: u32,
}

impl ReadinessPoll {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.poll_interval, config.max_poll_attempts)
    }

    /// Call `check` until it reports ready and return how many checks it took.
    ///
    /// An error from `check` aborts the wait. Running out of attempts yields
    /// `Kube2Error::Timeout` naming `what`.
    pub fn wait_until<F>(&self, what: &str, mut check: F) -> Result<u32>
    where
        F: FnMut() -> Result<bool>,
    {
        for attempt in 1..=self.max_attempts {
            if check()? {
                tracing::debug!(what, attempt, "ready");
                return Ok(attempt);
            }
            if attempt < self.max_attempts {
                thread::sleep(self.interval);
            }
        }

        Err(Kube2Error::Timeout {
            what: what.to_string(),
            attempts: self.max_attempts,
        }
        .into())
    }
}
