use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;
use tokio::time::Instant;
use tracing::warn;

pub const MAX_TIME_WARP: f64 = 400.0;

/// Process-wide time state, created once and shared as `Arc<RuntimeContext>`.
///
/// Local time is measured as seconds since the Unix epoch (like every timestamp on the wire),
///  but it advances with tokio's clock. That keeps it monotonic and lets tests drive it with
///  paused time.
#[derive(Debug)]
pub struct RuntimeContext {
    time_warp: f64,
    epoch_secs_at_start: f64,
    start: Instant,
}

impl RuntimeContext {
    pub fn new() -> RuntimeContext {
        let epoch_secs_at_start = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => {
                warn!("system clock is before the Unix epoch - starting local time at 0: {}", e);
                0.0
            }
        };

        RuntimeContext {
            time_warp: 1.0,
            epoch_secs_at_start,
            start: Instant::now(),
        }
    }

    /// A context whose local time starts at a fixed value, for deterministic tests and replay
    pub fn with_start_time(epoch_secs_at_start: f64) -> RuntimeContext {
        RuntimeContext {
            time_warp: 1.0,
            epoch_secs_at_start,
            start: Instant::now(),
        }
    }

    pub fn with_time_warp(mut self, time_warp: f64) -> anyhow::Result<RuntimeContext> {
        if !(time_warp > 0.0 && time_warp <= MAX_TIME_WARP) {
            bail!("time warp {} is out of range (0, {}]", time_warp, MAX_TIME_WARP);
        }
        self.time_warp = time_warp;
        Ok(self)
    }

    pub fn time_warp(&self) -> f64 {
        self.time_warp
    }

    /// seconds since the Unix epoch, with time warp applied to the time elapsed since startup
    pub fn local_time(&self) -> f64 {
        self.epoch_secs_at_start + self.start.elapsed().as_secs_f64() * self.time_warp
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        RuntimeContext::new()
    }
}
