//! Request/response correlation over a single duplex stream
//!
//! Each request gets the next correlation id of its session and a one-shot
//! slot in the pending table. The session driver resolves the slot when the
//! response with that id is read; teardown fails every remaining slot with
//! `ConnectionClosed`, so no caller waits forever.

use crate::error::SessionError;
use crate::session::Outbound;
use log::debug;
use protocol::{OutboundMessage, ProtocolError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

type Slot = oneshot::Sender<Result<Value, SessionError>>;

/// Abandoned ids remembered individually before the oldest are forgotten
pub const MAX_ABANDONED: usize = 1024;

/// Receiving end of one pending request
pub type PendingResponse = oneshot::Receiver<Result<Value, SessionError>>;

/// In-flight requests of one session keyed by correlation id
///
/// Every key corresponds to exactly one in-flight request. Entries leave
/// the table exactly once: when their response arrives, when the caller
/// abandons them, or when the session closes.
///
/// Abandoned ids are remembered so their late responses can be swallowed.
/// At most `MAX_ABANDONED` are kept; older ones collapse into a watermark
/// below which any unmatched response is swallowed too.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: u64,
    slots: HashMap<u64, Slot>,
    /// Ids whose caller gave up; their late responses are swallowed
    abandoned: BTreeSet<u64>,
    /// Every abandoned id below this one has been forgotten
    forgotten_below: u64,
    closed: bool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next correlation id and its slot
    ///
    /// Fails with `ConnectionClosed` once the session has been torn down.
    pub fn register(&mut self) -> Result<(u64, PendingResponse), SessionError> {
        if self.closed {
            return Err(SessionError::ConnectionClosed);
        }

        let request_id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id, tx);
        Ok((request_id, rx))
    }

    /// Delivers a response to the request that carries `request_id`
    ///
    /// A response for an id that was never issued, or that was already
    /// answered, means the stream is out of sync.
    pub fn resolve(&mut self, request_id: u64, results: Value) -> Result<(), ProtocolError> {
        if let Some(slot) = self.slots.remove(&request_id) {
            // The caller may have stopped listening; the slot is consumed either way
            let _ = slot.send(Ok(results));
            return Ok(());
        }

        if self.abandoned.remove(&request_id) {
            debug!("Discarding late response for abandoned request {}", request_id);
            return Ok(());
        }

        if request_id < self.forgotten_below {
            debug!("Discarding late response for old request {}", request_id);
            return Ok(());
        }

        Err(ProtocolError::UnknownCorrelationId(request_id))
    }

    /// Forgets a pending request whose caller gave up waiting
    ///
    /// Returns false when the request was already resolved. The eventual
    /// response for an abandoned id is discarded instead of being treated
    /// as a desync.
    pub fn abandon(&mut self, request_id: u64) -> bool {
        if self.slots.remove(&request_id).is_none() {
            return false;
        }

        self.abandoned.insert(request_id);
        if self.abandoned.len() > MAX_ABANDONED {
            if let Some(oldest) = self.abandoned.pop_first() {
                self.forgotten_below = self.forgotten_below.max(oldest + 1);
            }
        }
        true
    }

    /// Fails every pending request with `ConnectionClosed` and refuses new ones
    ///
    /// Returns the number of requests that were failed.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.abandoned.clear();

        let failed = self.slots.len();
        for (_, slot) in self.slots.drain() {
            let _ = slot.send(Err(SessionError::ConnectionClosed));
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Abandoned ids still remembered individually
    pub fn abandoned(&self) -> usize {
        self.abandoned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Issues requests on a session and awaits their responses
///
/// Waiting on a response suspends only the caller; the session keeps
/// reading other responses and ticks meanwhile.
#[derive(Clone)]
pub struct RequestMultiplexer {
    agent: Arc<str>,
    pending: Arc<Mutex<PendingRequests>>,
    outbound: Outbound,
}

impl RequestMultiplexer {
    pub(crate) fn new(
        agent: Arc<str>,
        pending: Arc<Mutex<PendingRequests>>,
        outbound: Outbound,
    ) -> Self {
        Self {
            agent,
            pending,
            outbound,
        }
    }

    /// Sends `method(arguments)` and waits for its result
    pub async fn request(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SessionError> {
        let (_, response) = self.issue(method, arguments).await?;
        response.await.unwrap_or(Err(SessionError::ConnectionClosed))
    }

    /// Like `request`, but gives up after `timeout`
    ///
    /// The protocol has no timeout of its own. On expiry the request is
    /// abandoned so its late response is drained instead of leaking a slot.
    pub async fn request_timeout(
        &self,
        method: &str,
        arguments: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let (request_id, response) = self.issue(method, arguments).await?;

        match tokio::time::timeout(timeout, response).await {
            Ok(result) => result.unwrap_or(Err(SessionError::ConnectionClosed)),
            Err(_) => {
                self.pending.lock().await.abandon(request_id);
                Err(SessionError::RequestTimedOut {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    /// Number of requests still waiting for a response
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn issue(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<(u64, PendingResponse), SessionError> {
        // The slot must exist before the request can reach the server
        let (request_id, response) = self.pending.lock().await.register()?;

        let message = OutboundMessage::Request {
            agent: self.agent.to_string(),
            request_id,
            method: method.to_string(),
            arguments,
        };

        if let Err(e) = self.outbound.send(&message) {
            self.pending.lock().await.abandon(request_id);
            return Err(e);
        }

        debug!("Sent request {} ({})", request_id, method);
        Ok((request_id, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::decode;
    use serde_json::json;
    use tokio::sync::{mpsc, watch};

    fn test_multiplexer() -> (
        RequestMultiplexer,
        Arc<Mutex<PendingRequests>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
        watch::Sender<bool>,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending = Arc::new(Mutex::new(PendingRequests::new()));
        let multiplexer = RequestMultiplexer::new(
            Arc::from("agent-1"),
            Arc::clone(&pending),
            Outbound::new(frames_tx, closed_rx),
        );
        (multiplexer, pending, frames_rx, closed_tx)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut table = PendingRequests::new();
        let ids: Vec<u64> = (0..5).map(|_| table.register().unwrap().0).collect();

        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_resolve_delivers_to_matching_slot() {
        let mut table = PendingRequests::new();
        let (first, mut first_rx) = table.register().unwrap();
        let (second, mut second_rx) = table.register().unwrap();

        table.resolve(second, json!("b")).unwrap();
        table.resolve(first, json!("a")).unwrap();

        assert_eq!(first_rx.try_recv().unwrap().unwrap(), json!("a"));
        assert_eq!(second_rx.try_recv().unwrap().unwrap(), json!("b"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_and_duplicate_responses() {
        let mut table = PendingRequests::new();
        let (id, _rx) = table.register().unwrap();

        assert_eq!(
            table.resolve(99, Value::Null),
            Err(ProtocolError::UnknownCorrelationId(99))
        );

        table.resolve(id, Value::Null).unwrap();
        assert_eq!(
            table.resolve(id, Value::Null),
            Err(ProtocolError::UnknownCorrelationId(id))
        );
    }

    #[test]
    fn test_abandoned_request_swallows_one_late_response() {
        let mut table = PendingRequests::new();
        let (id, _rx) = table.register().unwrap();

        assert!(table.abandon(id));
        assert!(!table.abandon(id));
        assert!(table.is_empty());

        assert!(table.resolve(id, json!(1)).is_ok());
        assert_eq!(
            table.resolve(id, json!(1)),
            Err(ProtocolError::UnknownCorrelationId(id))
        );
    }

    #[test]
    fn test_abandoned_ids_stay_bounded() {
        let mut table = PendingRequests::new();
        let total = 2 * MAX_ABANDONED as u64;

        for _ in 0..total {
            let (id, _rx) = table.register().unwrap();
            assert!(table.abandon(id));
        }
        assert_eq!(table.abandoned(), MAX_ABANDONED);
        assert!(table.is_empty());

        // Late responses for forgotten and remembered ids are both swallowed
        assert!(table.resolve(0, json!("late")).is_ok());
        assert!(table.resolve(total - 1, json!("late")).is_ok());
        assert_eq!(table.abandoned(), MAX_ABANDONED - 1);

        // Ids that were never issued still mean the stream is out of sync
        assert_eq!(
            table.resolve(total + 5, Value::Null),
            Err(ProtocolError::UnknownCorrelationId(total + 5))
        );

        // A request issued after the watermark is unaffected
        let (id, mut rx) = table.register().unwrap();
        table.resolve(id, json!("fresh")).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!("fresh"));
    }

    #[test]
    fn test_close_fails_every_slot_once() {
        let mut table = PendingRequests::new();
        let mut receivers: Vec<PendingResponse> =
            (0..3).map(|_| table.register().unwrap().1).collect();

        assert_eq!(table.close(), 3);
        assert_eq!(table.close(), 0);
        assert!(table.is_closed());

        for rx in &mut receivers {
            match rx.try_recv() {
                Ok(Err(SessionError::ConnectionClosed)) => {}
                other => panic!("expected ConnectionClosed, got {:?}", other),
            }
        }

        assert!(matches!(
            table.register(),
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_frame_and_resolution() {
        let (multiplexer, pending, mut frames, _closed) = test_multiplexer();

        let call = tokio::spawn({
            let multiplexer = multiplexer.clone();
            async move { multiplexer.request("ping", vec![json!(1)]).await }
        });

        let frame = frames.recv().await.unwrap();
        let sent: OutboundMessage = decode(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(
            sent,
            OutboundMessage::Request {
                agent: "agent-1".to_string(),
                request_id: 0,
                method: "ping".to_string(),
                arguments: vec![json!(1)],
            }
        );

        pending.lock().await.resolve(0, json!("pong")).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
        assert_eq!(multiplexer.pending().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout_abandons_slot() {
        let (multiplexer, pending, _frames, _closed) = test_multiplexer();

        let result = multiplexer
            .request_timeout("slow", vec![], Duration::from_millis(5))
            .await;

        match result {
            Err(SessionError::RequestTimedOut { request_id, .. }) => {
                assert_eq!(request_id, 0);
                assert!(pending.lock().await.resolve(0, json!("late")).is_ok());
            }
            other => panic!("expected RequestTimedOut, got {:?}", other),
        }
        assert_eq!(multiplexer.pending().await, 0);
    }

    #[tokio::test]
    async fn test_request_after_close_fails_fast() {
        let (multiplexer, pending, _frames, closed) = test_multiplexer();
        closed.send_replace(true);
        pending.lock().await.close();

        let result = multiplexer.request("ping", vec![]).await;
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
    }
}
