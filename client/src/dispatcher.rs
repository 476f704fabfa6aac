//! Tick dispatch
//!
//! Ticks read by the session driver are queued here and handed to the
//! registered handler one at a time, in arrival order. The handler runs on
//! its own task so a slow handler delays only later ticks, never the read
//! loop that resolves responses.
//!
//! Each tick is answered by exactly one batch. A handler either returns
//! its commands and the dispatcher submits them, or submits the batch
//! itself through the session's `MutationBatcher` and returns nothing.

use crate::batcher::MutationBatcher;
use crate::error::{HandlerError, SessionError};
use crate::session::{closed_signal, SessionEvent};
use log::{debug, trace};
use protocol::{Command, TickNotification};
use serde_json::Value;
use std::future::{ready, Future};
use std::pin::Pin;
use tokio::sync::{mpsc, watch};

/// What a handler produces for one tick: its commands, `None` for no-ops
pub type TickResult = Result<Vec<Option<Command>>, HandlerError>;

/// Pending outcome of an asynchronous tick handler
pub type TickFuture = Pin<Box<dyn Future<Output = TickResult> + Send + 'static>>;

/// Per-tick participant logic
///
/// Called with the tick index and the world snapshot of every tick, in
/// order. The returned commands are submitted as that tick's batch. An
/// error is fatal for the session; a handler that wants to survive bad
/// ticks has to catch its own failures.
pub trait TickHandler: Send + 'static {
    fn on_tick(&mut self, tick: u64, snapshot: &Value) -> TickResult;
}

impl<F> TickHandler for F
where
    F: FnMut(u64, &Value) -> TickResult + Send + 'static,
{
    fn on_tick(&mut self, tick: u64, snapshot: &Value) -> TickResult {
        self(tick, snapshot)
    }
}

/// Per-tick participant logic that awaits before answering
///
/// Lets a handler issue requests on its own session and build the batch
/// from their responses. The next tick is not dispatched until the
/// returned future completes, so invocations still never overlap.
pub trait AsyncTickHandler: Send + 'static {
    fn on_tick(&mut self, tick: u64, snapshot: Value) -> TickFuture;
}

impl<F, Fut> AsyncTickHandler for F
where
    F: FnMut(u64, Value) -> Fut + Send + 'static,
    Fut: Future<Output = TickResult> + Send + 'static,
{
    fn on_tick(&mut self, tick: u64, snapshot: Value) -> TickFuture {
        Box::pin(self(tick, snapshot))
    }
}

/// Runs a synchronous `TickHandler` where an asynchronous one is expected
pub(crate) struct Blocking<H>(pub(crate) H);

impl<H: TickHandler> AsyncTickHandler for Blocking<H> {
    fn on_tick(&mut self, tick: u64, snapshot: Value) -> TickFuture {
        Box::pin(ready(self.0.on_tick(tick, &snapshot)))
    }
}

pub(crate) struct TickDispatcher<H> {
    handler: H,
    ticks: mpsc::UnboundedReceiver<TickNotification>,
    batcher: MutationBatcher,
    closed: watch::Receiver<bool>,
}

impl<H: AsyncTickHandler> TickDispatcher<H> {
    pub(crate) fn new(
        handler: H,
        ticks: mpsc::UnboundedReceiver<TickNotification>,
        batcher: MutationBatcher,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            ticks,
            batcher,
            closed,
        }
    }

    /// Runs the dispatcher on its own task
    ///
    /// A handler error or panic is reported to the session driver, which
    /// tears the session down with it.
    pub(crate) fn spawn(self, events: mpsc::UnboundedSender<SessionEvent>) {
        tokio::spawn(async move {
            let outcome = match tokio::spawn(self.run()).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(SessionError::HandlerPanicked),
                Err(e) => Err(SessionError::TaskFailed(e.to_string())),
            };

            if let Err(e) = outcome {
                let _ = events.send(SessionEvent::Fatal(e));
            }
        });
    }

    async fn run(mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                biased;

                // No tick is dispatched once the session is torn down
                _ = closed_signal(&mut self.closed) => break,

                tick = self.ticks.recv() => match tick {
                    Some(tick) => self.dispatch(tick).await?,
                    None => break,
                },
            }
        }

        debug!("Tick dispatcher stopped");
        Ok(())
    }

    async fn dispatch(&mut self, notification: TickNotification) -> Result<(), SessionError> {
        let TickNotification { tick, snapshot } = notification;
        trace!("Dispatching tick {}", tick);

        let outcome = self.handler.on_tick(tick, snapshot).await;

        // A handler cut short by teardown has nothing left to answer
        if *self.closed.borrow() {
            return Ok(());
        }

        let commands: Vec<Command> = outcome
            .map_err(|source| SessionError::Handler { tick, source })?
            .into_iter()
            .flatten()
            .collect();

        if commands.is_empty() && self.batcher.has_submitted(tick) {
            trace!("Handler answered tick {} itself", tick);
            return Ok(());
        }

        self.batcher.submit(tick, commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use protocol::{decode, OutboundMessage};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    struct Recorder {
        seen: Vec<u64>,
    }

    impl TickHandler for Recorder {
        fn on_tick(&mut self, tick: u64, _snapshot: &Value) -> TickResult {
            self.seen.push(tick);
            Ok(vec![Some(Command::new("seen", json!(self.seen.clone())))])
        }
    }

    fn batcher() -> (MutationBatcher, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = watch::channel(false);
        let batcher = MutationBatcher::new(Arc::from("agent-1"), Outbound::new(frames_tx, closed_rx));
        (batcher, frames_rx)
    }

    fn batch(frame: &[u8]) -> (u64, Vec<Command>) {
        match decode::<OutboundMessage>(&frame[..frame.len() - 1]).unwrap() {
            OutboundMessage::Mutations { tick, commands, .. } => (tick, commands),
            other => panic!("expected a mutation batch, got {:?}", other),
        }
    }

    fn batch_tick(frame: &[u8]) -> u64 {
        batch(frame).0
    }

    fn queue_ticks(ticks: impl IntoIterator<Item = u64>) -> mpsc::UnboundedReceiver<TickNotification> {
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        for tick in ticks {
            ticks_tx
                .send(TickNotification {
                    tick,
                    snapshot: Value::Null,
                })
                .unwrap();
        }
        ticks_rx
    }

    #[tokio::test]
    async fn test_dispatches_queued_ticks_in_order() {
        let (batcher, mut frames) = batcher();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = watch::channel(false);

        for tick in [5, 6, 7] {
            ticks_tx
                .send(TickNotification {
                    tick,
                    snapshot: Value::Null,
                })
                .unwrap();
        }
        drop(ticks_tx);

        let dispatcher = TickDispatcher::new(Blocking(Recorder { seen: vec![] }), ticks_rx, batcher, closed_rx);
        assert_ok!(dispatcher.run().await);

        let ticks: Vec<u64> = std::iter::from_fn(|| frames.try_recv().ok())
            .map(|frame| batch_tick(&frame))
            .collect();
        assert_eq!(ticks, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_handler_error_stops_dispatch() {
        let (batcher, mut frames) = batcher();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = watch::channel(false);

        for tick in 1..=3 {
            ticks_tx
                .send(TickNotification {
                    tick,
                    snapshot: Value::Null,
                })
                .unwrap();
        }

        let handler = |tick: u64, _snapshot: &Value| -> TickResult {
            if tick == 2 {
                return Err("lost track of the world".into());
            }
            Ok(vec![])
        };

        let result = TickDispatcher::new(Blocking(handler), ticks_rx, batcher, closed_rx)
            .run()
            .await;

        match result {
            Err(SessionError::Handler { tick, .. }) => assert_eq!(tick, 2),
            other => panic!("expected a handler error, got {:?}", other),
        }
        assert_eq!(batch_tick(&frames.try_recv().unwrap()), 1);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_session_dispatches_nothing() {
        let (batcher, mut frames) = batcher();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        ticks_tx
            .send(TickNotification {
                tick: 1,
                snapshot: Value::Null,
            })
            .unwrap();
        closed_tx.send_replace(true);

        assert_ok!(
            TickDispatcher::new(Blocking(Recorder { seen: vec![] }), ticks_rx, batcher, closed_rx)
                .run()
                .await
        );

        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_submitting_itself_sends_one_batch() {
        let (batcher, mut frames) = batcher();
        let (_closed_tx, closed_rx) = watch::channel(false);
        let own = batcher.clone();

        let handler = move |tick: u64, _snapshot: &Value| -> TickResult {
            if tick % 2 == 0 {
                own.submit(tick, vec![Command::new("steer", json!([0, 1]))])?;
                return Ok(vec![]);
            }
            Ok(vec![Some(Command::new("shoot", json!([1, 0])))])
        };

        assert_ok!(
            TickDispatcher::new(Blocking(handler), queue_ticks(1..=4), batcher, closed_rx)
                .run()
                .await
        );

        let batches: Vec<(u64, Vec<Command>)> = std::iter::from_fn(|| frames.try_recv().ok())
            .map(|frame| batch(&frame))
            .collect();
        let ticks: Vec<u64> = batches.iter().map(|(tick, _)| *tick).collect();
        assert_eq!(ticks, vec![1, 2, 3, 4]);
        assert_eq!(batches[1].1, vec![Command::new("steer", json!([0, 1]))]);
        assert_eq!(batches[2].1, vec![Command::new("shoot", json!([1, 0]))]);
    }

    #[tokio::test]
    async fn test_second_batch_for_a_tick_is_an_error() {
        let (batcher, mut frames) = batcher();
        let (_closed_tx, closed_rx) = watch::channel(false);
        let own = batcher.clone();

        let handler = move |tick: u64, _snapshot: &Value| -> TickResult {
            own.submit(tick, vec![Command::new("steer", json!([0, 1]))])?;
            Ok(vec![Some(Command::new("shoot", json!([1, 0])))])
        };

        let result = TickDispatcher::new(Blocking(handler), queue_ticks([1]), batcher, closed_rx)
            .run()
            .await;

        assert!(matches!(
            result,
            Err(SessionError::BatchAlreadySubmitted { tick: 1 })
        ));
        assert_eq!(batch_tick(&frames.try_recv().unwrap()), 1);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_async_handler_answers_in_order() {
        let (batcher, mut frames) = batcher();
        let (_closed_tx, closed_rx) = watch::channel(false);

        let handler = |tick: u64, _snapshot: Value| async move {
            // Earlier ticks wait longer, so overlap would reorder batches
            tokio::time::sleep(std::time::Duration::from_millis(10 - tick)).await;
            Ok::<_, HandlerError>(vec![Some(Command::new("steer", json!([tick, 0])))])
        };

        assert_ok!(
            TickDispatcher::new(handler, queue_ticks([1, 2, 3]), batcher, closed_rx)
                .run()
                .await
        );

        let ticks: Vec<u64> = std::iter::from_fn(|| frames.try_recv().ok())
            .map(|frame| batch_tick(&frame))
            .collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }
}
