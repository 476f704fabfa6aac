//! Reply latency bookkeeping
//!
//! The harness stamps every tick it sends to a participant and matches the
//! participant's reply against that stamp. Latencies go into a fixed-size
//! ring so each report describes roughly the last second of traffic, while
//! per-participant timeout counts and the lost-reply count cover the whole
//! run.

use crate::config::HarnessConfig;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One matched reply
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub participant: Arc<str>,
    pub tick: u64,
    pub latency: Duration,
    /// Latency reached the timeout threshold
    pub timed_out: bool,
}

/// Fixed-capacity ring of the most recent samples
///
/// Slots are indexed by the sequence number of the sample itself, so every
/// recorded reply overwrites exactly the oldest one once the ring is full.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Vec<MetricSample>,
    capacity: usize,
    recorded: u64,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            recorded: 0,
        }
    }

    pub fn record(&mut self, sample: MetricSample) {
        let slot = (self.recorded % self.capacity as u64) as usize;
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[slot] = sample;
        }
        self.recorded += 1;
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples recorded since creation, including overwritten ones
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn timeouts(&self) -> u64 {
        self.samples.iter().filter(|s| s.timed_out).count() as u64
    }

    /// Mean latency in milliseconds, 0 when empty
    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let total: f64 = self.samples.iter().map(|s| as_ms(s.latency)).sum();
        total / self.samples.len() as f64
    }

    /// Population standard deviation in milliseconds, 0 when empty
    pub fn std_dev_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mean = self.mean_ms();
        let squares: f64 = self
            .samples
            .iter()
            .map(|s| (as_ms(s.latency) - mean).powi(2))
            .sum();
        (squares / self.samples.len() as f64).sqrt()
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Snapshot of the latency window published every report interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Samples in the window
    pub samples: usize,
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    /// Timeouts among the samples in the window
    pub timeouts: u64,
    /// Replies matched since the start of the run
    pub recorded: u64,
    /// Sends never answered within the expiry horizon
    pub lost: u64,
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mean: {:.2}ms  Timeouts: {}  Std dev: {:.2}ms  From samples: {}  Lost: {}",
            self.mean_ms, self.timeouts, self.std_dev_ms, self.samples, self.lost
        )
    }
}

/// Outcome of a finished harness run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessSummary {
    pub ticks: u64,
    pub participants: usize,
    /// Replies received from registered participants, matched or not
    pub replies: u64,
    pub unmatched: u64,
    pub lost: u64,
    /// Final state of the latency window
    pub report: LatencyReport,
    /// Whole-run timeouts, only for participants that had any
    pub timeouts_by_participant: BTreeMap<String, u64>,
}

impl HarnessSummary {
    pub fn total_timeouts(&self) -> u64 {
        self.timeouts_by_participant.values().sum()
    }
}

impl fmt::Display for HarnessSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ticks to {} participants, {} replies ({} unmatched, {} lost), {} timeouts; {}",
            self.ticks,
            self.participants,
            self.replies,
            self.unmatched,
            self.lost,
            self.total_timeouts(),
            self.report
        )
    }
}

/// Send stamps, matched replies and loss accounting for one harness run
///
/// Owned by the harness event loop; nothing here is shared across tasks.
#[derive(Debug)]
pub struct TickLedger {
    /// Send instant of every unanswered tick, per participant
    in_flight: BTreeMap<u64, HashMap<Arc<str>, Instant>>,
    window: LatencyWindow,
    threshold: Duration,
    expiry_ticks: u64,
    lost: u64,
    unmatched: u64,
    timeouts_by_participant: HashMap<Arc<str>, u64>,
}

impl TickLedger {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            in_flight: BTreeMap::new(),
            window: LatencyWindow::new(config.window_capacity()),
            threshold: config.timeout_threshold(),
            expiry_ticks: config.expiry_ticks(),
            lost: 0,
            unmatched: 0,
            timeouts_by_participant: HashMap::new(),
        }
    }

    pub fn record_send(&mut self, participant: &Arc<str>, tick: u64, at: Instant) {
        self.in_flight
            .entry(tick)
            .or_default()
            .insert(Arc::clone(participant), at);
    }

    /// Matches a reply against its send stamp
    ///
    /// Returns `None` for replies to ticks that were never sent to this
    /// participant, already answered, or already expired.
    pub fn record_reply(&mut self, participant: &str, tick: u64, at: Instant) -> Option<MetricSample> {
        let sent = self.in_flight.get_mut(&tick);
        let Some((participant, sent_at)) = sent.and_then(|sent| sent.remove_entry(participant)) else {
            self.unmatched += 1;
            debug!("Unmatched reply from {} for tick {}", participant, tick);
            return None;
        };

        if self.in_flight.get(&tick).map_or(false, HashMap::is_empty) {
            self.in_flight.remove(&tick);
        }

        Some(self.record_latency(participant, tick, at.saturating_duration_since(sent_at)))
    }

    /// Records a reply latency directly
    pub fn record_latency(&mut self, participant: Arc<str>, tick: u64, latency: Duration) -> MetricSample {
        let timed_out = latency >= self.threshold;
        if timed_out {
            *self
                .timeouts_by_participant
                .entry(Arc::clone(&participant))
                .or_insert(0) += 1;
        }

        let sample = MetricSample {
            participant,
            tick,
            latency,
            timed_out,
        };
        self.window.record(sample.clone());
        sample
    }

    /// Gives up on sends older than the expiry horizon, counting them as lost
    ///
    /// `current_tick` is the tick about to be sent. Returns the number of
    /// sends expired by this call.
    pub fn expire(&mut self, current_tick: u64) -> u64 {
        let Some(horizon) = current_tick.checked_sub(self.expiry_ticks) else {
            return 0;
        };

        let kept = self.in_flight.split_off(&horizon);
        let expired: u64 = self.in_flight.values().map(|sent| sent.len() as u64).sum();
        self.in_flight = kept;

        self.lost += expired;
        expired
    }

    /// Expires every remaining send; used when the run is over
    pub fn expire_all(&mut self) -> u64 {
        let expired: u64 = self.in_flight.values().map(|sent| sent.len() as u64).sum();
        self.in_flight.clear();
        self.lost += expired;
        expired
    }

    /// Closes the books: every send still in flight is lost
    pub fn summarize(&mut self, ticks: u64, participants: usize, replies: u64) -> HarnessSummary {
        self.expire_all();

        HarnessSummary {
            ticks,
            participants,
            replies,
            unmatched: self.unmatched,
            lost: self.lost,
            report: self.report(),
            timeouts_by_participant: self.timeouts_by_participant(),
        }
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport {
            samples: self.window.len(),
            mean_ms: self.window.mean_ms(),
            std_dev_ms: self.window.std_dev_ms(),
            timeouts: self.window.timeouts(),
            recorded: self.window.recorded(),
            lost: self.lost,
        }
    }

    pub fn window(&self) -> &LatencyWindow {
        &self.window
    }

    /// Sends still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.in_flight.values().map(HashMap::len).sum()
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Replies that matched no send
    pub fn unmatched(&self) -> u64 {
        self.unmatched
    }

    pub fn timeouts_of(&self, participant: &str) -> u64 {
        self.timeouts_by_participant
            .get(participant)
            .copied()
            .unwrap_or(0)
    }

    /// Whole-run timeout counts, sorted by participant id
    pub fn timeouts_by_participant(&self) -> BTreeMap<String, u64> {
        self.timeouts_by_participant
            .iter()
            .map(|(participant, count)| (participant.to_string(), *count))
            .collect()
    }
}
