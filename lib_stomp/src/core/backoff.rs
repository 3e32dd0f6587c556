//! Linear reconnect backoff: `base`, then `+step` per failed attempt, capped.

use std::time::Duration;

use crate::configs::StompConfig;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    step: Duration,
    cap: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            base,
            step,
            cap: cap.max(base),
            failures: 0,
        }
    }

    pub fn from_config(config: &StompConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_step(),
            config.reconnect_max_delay(),
        )
    }

    /// Delay before the next attempt, given the failures so far.
    pub fn current(&self) -> Duration {
        let grown = self.base.saturating_add(self.step.saturating_mul(self.failures));
        grown.min(self.cap)
    }

    /// Records a failed attempt and returns the delay to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
