use std::time::Duration;

/// Linear reconnect schedule: 1s, 2s, 3s, ... capped at 30s.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    step: Duration,
    max: Duration,
    failures: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(1_000),
            Duration::from_millis(1_000),
            Duration::from_millis(30_000),
        )
    }
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        Self {
            initial,
            step,
            max,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let extra = self.step.saturating_mul(self.failures - 1);
        self.initial.saturating_add(extra).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
