//! One participant connection
//!
//! A session owns a single duplex byte stream. After the handshake it runs
//! two tasks: a writer that drains the outbound frame queue in order, and a
//! driver that reads frames and routes them. Responses resolve pending
//! requests, tick pushes are queued for the tick dispatcher, and anything
//! else tears the session down. Teardown is one-way: the closed flag is
//! raised, the dispatcher stops, and every pending request fails with
//! `ConnectionClosed`.

use crate::batcher::MutationBatcher;
use crate::dispatcher::{AsyncTickHandler, Blocking, TickDispatcher, TickHandler, TickResult};
use crate::error::SessionError;
use crate::multiplexer::{PendingRequests, RequestMultiplexer};
use log::{debug, error, info, trace, warn};
use protocol::{encode_line, Command, InboundMessage, LineBuffer, OutboundMessage, ProtocolError};
use protocol::{TickNotification, TICK_METHOD};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

/// Warn every this many ticks queued while no handler is registered
const UNHANDLED_TICK_WARNING: u64 = 100;

/// Signals delivered to the session driver from outside the read loop
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A failure detected elsewhere that must end the session
    Fatal(SessionError),
    /// Orderly shutdown requested by the owner
    Close,
}

/// Write side shared by requests and batches
///
/// Frames are queued whole, so concurrent writers never interleave bytes
/// of two records.
#[derive(Clone)]
pub(crate) struct Outbound {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

impl Outbound {
    pub(crate) fn new(frames: mpsc::UnboundedSender<Vec<u8>>, closed: watch::Receiver<bool>) -> Self {
        Self { frames, closed }
    }

    pub(crate) fn send(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionClosed);
        }

        let frame = encode_line(message)?;
        self.frames
            .send(frame)
            .map_err(|_| SessionError::ConnectionClosed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Cloneable access to a running session
///
/// Handles can issue requests and submit batches from any task. They stay
/// valid after the session ends; every call then fails with
/// `ConnectionClosed`.
#[derive(Clone)]
pub struct SessionHandle {
    participant_id: Arc<str>,
    requests: RequestMultiplexer,
    batcher: MutationBatcher,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: watch::Receiver<bool>,
    ticks: Arc<TickBacklog>,
}

impl SessionHandle {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Sends a request and waits for its response
    pub async fn request(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SessionError> {
        self.requests.request(method, arguments).await
    }

    /// Sends a request and gives up waiting after `timeout`
    pub async fn request_timeout(
        &self,
        method: &str,
        arguments: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        self.requests.request_timeout(method, arguments, timeout).await
    }

    /// Submits the command batch of `tick` outside of a tick handler
    pub fn submit<I, C>(&self, tick: u64, commands: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = C>,
        C: Into<Option<Command>>,
    {
        self.batcher.submit(tick, commands)
    }

    pub fn batcher(&self) -> &MutationBatcher {
        &self.batcher
    }

    /// Number of requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        self.requests.pending().await
    }

    /// Ticks that arrived while no handler was registered
    ///
    /// They are kept and delivered once a handler registers; a session
    /// that never registers one keeps accumulating them.
    pub fn unhandled_ticks(&self) -> u64 {
        self.ticks.unhandled.load(Ordering::Acquire)
    }

    /// Asks the session to shut down; returns immediately
    pub fn close(&self) {
        let _ = self.events.send(SessionEvent::Close);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until the session has been torn down
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        closed_signal(&mut closed).await;
    }
}

/// A connected, handshaken participant session
pub struct Session {
    handle: SessionHandle,
    ticks: Option<mpsc::UnboundedReceiver<TickNotification>>,
    driver: JoinHandle<Result<(), SessionError>>,
}

impl Session {
    /// Connects over TCP and performs the handshake
    pub async fn connect(addr: &str, participant_id: &str) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SessionError::Connection {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        info!("Connected to {} as {}", addr, participant_id);
        Self::establish(stream, participant_id).await
    }

    /// Runs a session over an already-open stream
    ///
    /// The handshake is written and flushed before any other record can be
    /// queued, so it is always the first line on the wire.
    pub async fn establish<S>(mut stream: S, participant_id: &str) -> Result<Self, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake = encode_line(&OutboundMessage::handshake(participant_id))?;
        stream
            .write_all(&handshake)
            .await
            .map_err(SessionError::Handshake)?;
        stream.flush().await.map_err(SessionError::Handshake)?;
        debug!("Handshake sent for {}", participant_id);

        let participant_id: Arc<str> = Arc::from(participant_id);
        let (reader, writer) = tokio::io::split(stream);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending = Arc::new(Mutex::new(PendingRequests::new()));
        let outbound = Outbound::new(frames_tx, closed_rx.clone());
        let backlog = Arc::new(TickBacklog::default());

        tokio::spawn(write_frames(
            writer,
            frames_rx,
            closed_rx.clone(),
            events_tx.clone(),
        ));

        let driver = Driver {
            reader,
            buffer: LineBuffer::new(),
            pending: Arc::clone(&pending),
            ticks: ticks_tx,
            events: events_rx,
            closed: closed_tx,
            last_tick: None,
            backlog: Arc::clone(&backlog),
            participant_id: Arc::clone(&participant_id),
        };
        let driver = tokio::spawn(driver.run());

        let handle = SessionHandle {
            requests: RequestMultiplexer::new(Arc::clone(&participant_id), pending, outbound.clone()),
            batcher: MutationBatcher::new(Arc::clone(&participant_id), outbound),
            participant_id,
            events: events_tx,
            closed: closed_rx,
            ticks: backlog,
        };

        Ok(Self {
            handle,
            ticks: Some(ticks_rx),
            driver,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn participant_id(&self) -> &str {
        self.handle.participant_id()
    }

    /// Registers the per-tick closure of this session
    ///
    /// Ticks that arrived before registration are queued and delivered
    /// first, in order. Only one handler may be registered per session.
    pub fn on_tick<F>(&mut self, handler: F) -> Result<(), SessionError>
    where
        F: FnMut(u64, &Value) -> TickResult + Send + 'static,
    {
        self.register(handler)
    }

    /// Registers any `TickHandler` implementation
    pub fn register<H: TickHandler>(&mut self, handler: H) -> Result<(), SessionError> {
        self.register_async(Blocking(handler))
    }

    /// Registers a per-tick closure that may await, e.g. on requests
    ///
    /// ```no_run
    /// # use client::{HandlerError, Session, SessionError};
    /// # use serde_json::Value;
    /// # async fn example(mut session: Session) -> Result<(), SessionError> {
    /// let handle = session.handle();
    /// session.on_tick_async(move |tick: u64, _world: Value| {
    ///     let handle = handle.clone();
    ///     async move {
    ///         let position = handle.request("position", vec![]).await?;
    ///         log::debug!("Tick {} at {}", tick, position);
    ///         Ok::<_, HandlerError>(vec![])
    ///     }
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn on_tick_async<F, Fut>(&mut self, handler: F) -> Result<(), SessionError>
    where
        F: FnMut(u64, Value) -> Fut + Send + 'static,
        Fut: Future<Output = TickResult> + Send + 'static,
    {
        self.register_async(handler)
    }

    /// Registers any `AsyncTickHandler` implementation
    pub fn register_async<H: AsyncTickHandler>(&mut self, handler: H) -> Result<(), SessionError> {
        let ticks = self
            .ticks
            .take()
            .ok_or(SessionError::HandlerAlreadyRegistered)?;
        self.handle.ticks.registered.store(true, Ordering::Release);

        TickDispatcher::new(
            handler,
            ticks,
            self.handle.batcher.clone(),
            self.handle.closed.clone(),
        )
        .spawn(self.handle.events.clone());
        Ok(())
    }

    pub async fn request(&self, method: &str, arguments: Vec<Value>) -> Result<Value, SessionError> {
        self.handle.request(method, arguments).await
    }

    pub async fn request_timeout(
        &self,
        method: &str,
        arguments: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        self.handle.request_timeout(method, arguments, timeout).await
    }

    pub fn submit<I, C>(&self, tick: u64, commands: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = C>,
        C: Into<Option<Command>>,
    {
        self.handle.submit(tick, commands)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Waits for the session to end
    ///
    /// Returns `Ok` when the peer closed the stream or `close` was called,
    /// and the fatal error otherwise.
    pub async fn run(self) -> Result<(), SessionError> {
        match self.driver.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::TaskFailed(e.to_string())),
        }
    }
}

/// Whether ticks have a consumer yet, and how many arrived without one
#[derive(Debug, Default)]
struct TickBacklog {
    registered: AtomicBool,
    unhandled: AtomicU64,
}

/// Read side of a session
struct Driver<R> {
    reader: R,
    buffer: LineBuffer,
    pending: Arc<Mutex<PendingRequests>>,
    ticks: mpsc::UnboundedSender<TickNotification>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    closed: watch::Sender<bool>,
    last_tick: Option<u64>,
    backlog: Arc<TickBacklog>,
    participant_id: Arc<str>,
}

impl<R: AsyncRead + Unpin> Driver<R> {
    async fn run(mut self) -> Result<(), SessionError> {
        let outcome = self.read_loop().await;

        match &outcome {
            Ok(()) => info!("Session {} closed", self.participant_id),
            Err(e) => error!("Session {} terminated: {}", self.participant_id, e),
        }

        // Raised before failing the table so no request can slip in between
        self.closed.send_replace(true);
        let failed = self.pending.lock().await.close();
        if failed > 0 {
            warn!(
                "Failed {} pending requests of session {}",
                failed, self.participant_id
            );
        }

        outcome
    }

    async fn read_loop(&mut self) -> Result<(), SessionError> {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(SessionEvent::Fatal(e)) => return Err(e),
                    Some(SessionEvent::Close) | None => return Ok(()),
                },

                read = self.reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        if !self.buffer.is_empty() {
                            warn!(
                                "Stream closed with {} bytes of an incomplete frame",
                                self.buffer.buffered()
                            );
                        }
                        return Ok(());
                    }

                    self.buffer.extend(&chunk[..n]);
                    while let Some(message) = self.buffer.next_message::<InboundMessage>()? {
                        self.route(message).await?;
                    }
                }
            }
        }
    }

    async fn route(&mut self, message: InboundMessage) -> Result<(), SessionError> {
        match message {
            InboundMessage::Response {
                request_id,
                results,
            } => {
                trace!("Response for request {}", request_id);
                self.pending.lock().await.resolve(request_id, results)?;
            }
            InboundMessage::Push { method, arguments } if method == TICK_METHOD => {
                let notification = TickNotification::from_arguments(arguments)?;
                self.accept_tick(notification)?;
            }
            InboundMessage::Push { method, .. } => {
                return Err(ProtocolError::UnknownMethod(method).into());
            }
        }
        Ok(())
    }

    fn accept_tick(&mut self, notification: TickNotification) -> Result<(), SessionError> {
        if let Some(last) = self.last_tick {
            if notification.tick <= last {
                return Err(ProtocolError::InvalidMessage(format!(
                    "tick {} received after tick {}",
                    notification.tick, last
                ))
                .into());
            }
        }

        trace!("Tick {} received", notification.tick);
        self.last_tick = Some(notification.tick);

        if !self.backlog.registered.load(Ordering::Acquire) {
            let unhandled = self.backlog.unhandled.fetch_add(1, Ordering::AcqRel) + 1;
            if unhandled % UNHANDLED_TICK_WARNING == 0 {
                warn!(
                    "Session {} has queued {} ticks with no tick handler registered",
                    self.participant_id, unhandled
                );
            }
        }

        // Nobody listens once the session owner dropped the receiver
        let _ = self.ticks.send(notification);
        Ok(())
    }
}

/// Resolves once the closed flag is raised or its sender is gone
pub(crate) async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Write side of a session
async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        tokio::select! {
            biased;

            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    let _ = events.send(SessionEvent::Fatal(SessionError::Io(e)));
                    break;
                }
            }

            _ = closed_signal(&mut closed) => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down the write side: {}", e);
    }
}
