//! Harness configuration and the timing quantities derived from it

use crate::error::HarnessError;
use std::time::Duration;

/// Parameters of one harness run
///
/// Every derived quantity (tick period, timeout threshold, window size) is
/// computed from these fields, so changing the tick rate keeps the timeout
/// at the same fraction of a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Address the harness listens on
    pub bind_addr: String,
    /// Participants that must join before ticking starts
    pub participants: usize,
    pub ticks_per_second: u32,
    /// Fraction of the tick period after which a reply counts as a timeout
    pub timeout_ratio: f64,
    /// How often a latency report is published, independent of the tick rate
    pub report_interval: Duration,
    /// Stop ticking after this many ticks; `None` runs until shut down
    pub max_ticks: Option<u64>,
    /// How long late replies are still collected after the last tick
    pub drain_period: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8888".to_string(),
            participants: 100,
            ticks_per_second: 100,
            timeout_ratio: 0.6,
            report_interval: Duration::from_secs(1),
            max_ticks: None,
            drain_period: Duration::from_millis(500),
        }
    }
}

impl HarnessConfig {
    /// Time between two ticks
    pub fn tick_period(&self) -> Duration {
        let rate = f64::from(self.ticks_per_second.max(1));
        Duration::from_nanos((1e9 / rate).round() as u64)
    }

    /// Replies at or above this latency are timeouts
    pub fn timeout_threshold(&self) -> Duration {
        let period = self.tick_period().as_nanos() as f64;
        Duration::from_nanos((period * self.timeout_ratio).round() as u64)
    }

    /// Samples retained by the latency window
    ///
    /// One second of replies plus one more tick's worth, so a full second
    /// still fits when replies straddle the window boundary.
    pub fn window_capacity(&self) -> usize {
        let participants = self.participants;
        (self.ticks_per_second as usize * participants + participants).max(1)
    }

    /// Ticks after which an unanswered send is given up as lost
    pub fn expiry_ticks(&self) -> u64 {
        u64::from(self.ticks_per_second.max(1))
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.participants == 0 {
            return Err(HarnessError::InvalidConfig(
                "at least one participant is required".to_string(),
            ));
        }

        if self.ticks_per_second == 0 {
            return Err(HarnessError::InvalidConfig(
                "tick rate must be positive".to_string(),
            ));
        }

        if !self.timeout_ratio.is_finite() || self.timeout_ratio <= 0.0 {
            return Err(HarnessError::InvalidConfig(format!(
                "timeout ratio must be a positive number, got {}",
                self.timeout_ratio
            )));
        }

        if self.report_interval.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "report interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
