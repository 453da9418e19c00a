use std::cmp::min;
use std::time::Duration;

/// Delay between reconnect attempts: starts at `initial`, grows by `factor_eighths / 8` per
///  failed attempt up to `max`, and drops back to `initial` once a connection succeeds.
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let result = ExponentialBackoff {
            next_delay: initial,
            config_initial: initial,
            config_max: max,
            config_factor_eighths: 8*2,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    /// returns the delay to wait before the next attempt and advances the backoff
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = min(self.next_delay * self.config_factor_eighths / 8, self.config_max);
        result
    }

    pub fn reset(&mut self) {
        self.next_delay = self.config_initial;
    }
}
