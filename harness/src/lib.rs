//! # Load/Timing Harness
//!
//! Validates that N concurrent participants can keep up with a fixed tick
//! budget. The harness plays the server: it pushes one tick per period to
//! every participant and measures how long each participant takes to send
//! back that tick's mutation batch.
//!
//! ## Run Lifecycle
//!
//! 1. Bind and wait until the expected number of participants have
//!    handshaked. No tick is sent before that.
//! 2. Tick at `ticks_per_second`. Each send is stamped per
//!    (participant, tick) once it completes; a reply is matched against
//!    its stamp and the elapsed time recorded.
//! 3. Every `report_interval` publish a `LatencyReport` over the most
//!    recent second of samples: mean, population standard deviation and the
//!    number of replies at or above `timeout_ratio × tick period`.
//! 4. Optionally stop after `max_ticks`, collect late replies for
//!    `drain_period`, and return a `HarnessSummary`.
//!
//! ## Transports
//!
//! - `network::LoadHarness` over UDP, one JSON record per datagram, for
//!   participants speaking the `{AgentId, Type, Payload}` variant
//! - `stream::StreamHarness` over TCP with the line-delimited session
//!   protocol, for `client::Session` participants
//!
//! ## Module Organization
//!
//! - `config`: `HarnessConfig` and the tick period, threshold and window
//!   sizes derived from it
//! - `metrics`: the latency ring, send stamps, lost replies and reports
//! - `participants`: who joined and how to reach them
//! - `schedule`: tick, report and drain timers plus shutdown
//! - `simulated`: UDP participants with configurable reply delay

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod participants;
pub mod schedule;
pub mod simulated;
pub mod stream;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use metrics::{HarnessSummary, LatencyReport, LatencyWindow, MetricSample, TickLedger};
pub use network::LoadHarness;
pub use participants::ParticipantRegistry;
pub use schedule::ShutdownHandle;
pub use simulated::{spawn_fleet, ReplyDelay, SimulatedParticipant};
pub use stream::StreamHarness;
