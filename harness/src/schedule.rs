//! Timers driving a harness run
//!
//! A run has three clocks: the tick timer, which only starts once every
//! expected participant has joined; the report timer, which runs from the
//! start at its own interval; and the drain deadline, armed when a bounded
//! run sends its last tick.

use crate::config::HarnessConfig;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// What woke the harness up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClockEvent {
    Tick,
    Report,
    Drained,
}

pub(crate) struct TickClock {
    period: Duration,
    drain_period: Duration,
    max_ticks: Option<u64>,
    ticker: Option<Interval>,
    reporter: Interval,
    drain_deadline: Option<Instant>,
    ticks: u64,
}

impl TickClock {
    pub(crate) fn new(config: &HarnessConfig) -> Self {
        let mut reporter = interval_at(
            Instant::now() + config.report_interval,
            config.report_interval,
        );
        reporter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            period: config.tick_period(),
            drain_period: config.drain_period,
            max_ticks: config.max_ticks,
            ticker: None,
            reporter,
            drain_deadline: None,
            ticks: 0,
        }
    }

    /// Starts ticking; the first tick fires immediately
    pub(crate) fn start(&mut self) {
        if self.ticker.is_some() || self.drain_deadline.is_some() {
            return;
        }

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
    }

    pub(crate) fn is_ticking(&self) -> bool {
        self.ticker.is_some()
    }

    /// Ticks fired so far
    pub(crate) fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Waits for the next timer event
    ///
    /// Once the tick limit is reached the tick timer is dropped and the
    /// drain deadline armed in its place.
    pub(crate) async fn next(&mut self) -> ClockEvent {
        let event = tokio::select! {
            _ = next_tick(&mut self.ticker) => ClockEvent::Tick,
            _ = self.reporter.tick() => ClockEvent::Report,
            _ = deadline(self.drain_deadline) => ClockEvent::Drained,
        };

        if event == ClockEvent::Tick {
            self.ticks += 1;
            if self.max_ticks.map_or(false, |max| self.ticks >= max) {
                self.ticker = None;
                self.drain_deadline = Some(Instant::now() + self.drain_period);
            }
        }

        event
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}

/// Stops a running harness from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { signal: Arc::new(tx) }, rx)
    }

    /// Ends the run; the harness returns its summary as if drained
    pub fn shutdown(&self) {
        self.signal.send_replace(true);
    }
}

/// Resolves once shutdown is requested
pub(crate) async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        // A dropped handle never fires
        if signal.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}
