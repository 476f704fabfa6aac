//! Per-tick command batching
//!
//! A participant answers each tick with one batch of commands. Batches are
//! fire-and-forget: the server never confirms them, and a batch that fails
//! to send is not retried since replaying it a tick late would apply a
//! stale action.
//!
//! There is at most one batch per tick, and ticks only move forward: once
//! the batch of tick K is out, batches for K or any earlier tick are
//! rejected.

use crate::error::SessionError;
use crate::session::Outbound;
use log::trace;
use protocol::{Command, OutboundMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The ordered commands of one tick
///
/// `None` entries stand for conditional commands that did not fire and
/// are dropped on insertion. The remaining order is the order in which
/// the server applies the commands.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBatch {
    tick: u64,
    commands: Vec<Command>,
}

impl CommandBatch {
    pub fn new<I, C>(tick: u64, commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Option<Command>>,
    {
        Self {
            tick,
            commands: commands.into_iter().filter_map(|command| command.into()).collect(),
        }
    }

    pub fn push(&mut self, command: impl Into<Option<Command>>) {
        if let Some(command) = command.into() {
            self.commands.push(command);
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn into_message(self, agent: &str) -> OutboundMessage {
        OutboundMessage::Mutations {
            agent: agent.to_string(),
            tick: self.tick,
            commands: self.commands,
        }
    }
}

/// Sends command batches through a session
///
/// Clones share the record of which ticks were already answered, so a
/// handler submitting through a `SessionHandle` and the tick dispatcher
/// never both send a batch for the same tick.
#[derive(Clone)]
pub struct MutationBatcher {
    agent: Arc<str>,
    outbound: Outbound,
    /// One past the highest tick submitted so far, 0 before the first batch
    next_tick: Arc<AtomicU64>,
}

impl MutationBatcher {
    pub(crate) fn new(agent: Arc<str>, outbound: Outbound) -> Self {
        Self {
            agent,
            outbound,
            next_tick: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Packages `commands` as the batch of `tick` and queues it
    ///
    /// Returns as soon as the batch is queued for writing; there is no
    /// acknowledgement to wait for. Fails with `BatchAlreadySubmitted` if
    /// `tick`, or a later tick, already has its batch.
    pub fn submit<I, C>(&self, tick: u64, commands: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = C>,
        C: Into<Option<Command>>,
    {
        self.send(CommandBatch::new(tick, commands))
    }

    pub fn send(&self, batch: CommandBatch) -> Result<(), SessionError> {
        let tick = batch.tick();
        let claimed = tick.saturating_add(1);
        if self.next_tick.fetch_max(claimed, Ordering::AcqRel) >= claimed {
            return Err(SessionError::BatchAlreadySubmitted { tick });
        }

        trace!("Submitting {} commands for tick {}", batch.len(), tick);
        self.outbound.send(&batch.into_message(&self.agent))
    }

    /// True once a batch for `tick` or a later tick has been submitted
    pub fn has_submitted(&self, tick: u64) -> bool {
        self.next_tick.load(Ordering::Acquire) > tick
    }
}
