//! Stream load harness
//!
//! Same tick loop and metrics as the datagram harness, but over TCP with the
//! line-delimited session protocol, so real `client::Session`s can be driven
//! and timed. Each connection gets a reader task that decodes participant
//! records and a writer task that drains the connection's frame queue; the
//! main loop only sees joins, batches and departures.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::metrics::{HarnessSummary, LatencyReport, TickLedger};
use crate::network::snapshot;
use crate::participants::ParticipantRegistry;
use crate::schedule::{shutdown_requested, ClockEvent, ShutdownHandle, TickClock};
use log::{debug, error, info, warn};
use protocol::{encode_line, InboundMessage, LineBuffer, OutboundMessage, ProtocolError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 4096;

/// Frame queue of one connection
pub type FrameSender = mpsc::UnboundedSender<Arc<[u8]>>;

/// How the harness reaches a stream participant
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    /// Distinguishes a rejoin from the connection it replaced
    pub connection: u64,
    pub addr: SocketAddr,
    pub frames: FrameSender,
}

/// Messages sent from connection tasks to the main harness loop
#[derive(Debug)]
pub enum StreamEvent {
    Joined {
        agent: Arc<str>,
        endpoint: StreamEndpoint,
    },
    Batch {
        agent: Arc<str>,
        connection: u64,
        tick: u64,
        commands: usize,
        received_at: Instant,
    },
    Left {
        agent: Arc<str>,
        connection: u64,
    },
}

/// Drives N session participants over TCP at a fixed tick rate
pub struct StreamHarness {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: HarnessConfig,
    participants: ParticipantRegistry<StreamEndpoint>,
    ledger: TickLedger,
    tick: u64,
    current_tick: watch::Sender<u64>,
    subscribers: Vec<mpsc::UnboundedSender<LatencyReport>>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHarness {
    pub async fn bind(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Harness listening on {} (tcp)", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = ShutdownHandle::new();
        let (current_tick, _) = watch::channel(0);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            participants: ParticipantRegistry::new(config.participants),
            ledger: TickLedger::new(&config),
            config,
            tick: 0,
            current_tick,
            subscribers: Vec::new(),
            shutdown,
            shutdown_rx,
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Receives every latency report published during the run
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LatencyReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Spawns task that accepts connections until the harness is gone
    fn spawn_acceptor(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let events = self.events_tx.clone();
        let current_tick = self.current_tick.subscribe();

        tokio::spawn(async move {
            let mut next_connection = 0u64;

            loop {
                tokio::select! {
                    _ = events.closed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            next_connection += 1;
                            debug!("Connection {} from {}", next_connection, addr);
                            tokio::spawn(serve_connection(
                                stream,
                                addr,
                                next_connection,
                                events.clone(),
                                current_tick.clone(),
                            ));
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Joined { agent, endpoint } => {
                let addr = endpoint.addr;
                if self.participants.join(&agent, endpoint).is_none() {
                    warn!(
                        "All {} participants already joined, ignoring {} from {}",
                        self.participants.expected(),
                        agent,
                        addr
                    );
                }
            }

            StreamEvent::Batch {
                agent,
                connection,
                tick,
                commands,
                received_at,
            } => {
                if !self.is_current(&agent, connection) {
                    debug!("Batch from stale connection {} of {}", connection, agent);
                    return;
                }

                self.participants.record_reply(&agent);
                if let Some(sample) = self.ledger.record_reply(&agent, tick, received_at) {
                    if sample.timed_out {
                        debug!(
                            "Participant {} answered tick {} with {} commands in {:.2}ms",
                            agent,
                            tick,
                            commands,
                            sample.latency.as_secs_f64() * 1000.0
                        );
                    }
                }
            }

            StreamEvent::Left { agent, connection } => {
                if self.is_current(&agent, connection) {
                    self.participants.leave(&agent);
                }
            }
        }
    }

    /// The registered endpoint of `agent` is still `connection`
    fn is_current(&self, agent: &str, connection: u64) -> bool {
        self.participants
            .get(agent)
            .map_or(false, |participant| participant.endpoint.connection == connection)
    }

    /// Queues the current tick for every participant and stamps each one
    ///
    /// A participant is stamped as its own frame is queued, so it is not
    /// charged for the frames queued before it.
    fn send_tick(&mut self) -> Result<(), HarnessError> {
        let tick = self.tick;
        let endpoints = self.participants.endpoints();

        let frame: Arc<[u8]> =
            encode_line(&InboundMessage::tick(tick, snapshot(endpoints.len())))?.into();
        self.current_tick.send_replace(tick);

        for (id, endpoint) in endpoints {
            let sent_at = Instant::now();
            match endpoint.frames.send(Arc::clone(&frame)) {
                Ok(()) => self.ledger.record_send(&id, tick, sent_at),
                Err(_) => debug!("Connection of {} is gone, tick {} not sent", id, tick),
            }
        }

        self.tick += 1;

        let lost = self.ledger.expire(self.tick);
        if lost > 0 {
            debug!("{} sends expired unanswered before tick {}", lost, self.tick);
        }

        Ok(())
    }

    fn publish_report(&mut self) {
        let report = self.ledger.report();
        info!("{}", report);

        self.subscribers
            .retain(|subscriber| subscriber.send(report.clone()).is_ok());
    }

    /// Main harness loop, see `LoadHarness::run`
    pub async fn run(mut self) -> Result<HarnessSummary, HarnessError> {
        self.spawn_acceptor();

        let mut clock = TickClock::new(&self.config);
        let mut shutdown = self.shutdown_rx.clone();

        info!("Waiting for {} participants", self.config.participants);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Harness shutting down");
                    break;
                },

                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);

                    if self.participants.is_full() && !clock.is_ticking() && clock.ticks() == 0 {
                        info!(
                            "All {} participants joined, ticking every {:?}",
                            self.participants.len(),
                            self.config.tick_period()
                        );
                        clock.start();
                    }
                },

                event = clock.next() => match event {
                    ClockEvent::Tick => self.send_tick()?,
                    ClockEvent::Report => self.publish_report(),
                    ClockEvent::Drained => {
                        info!("Drain period over after {} ticks", clock.ticks());
                        break;
                    }
                },
            }
        }

        let summary = self.ledger.summarize(
            self.tick,
            self.participants.len(),
            self.participants.total_replies(),
        );
        info!("{}", summary);
        Ok(summary)
    }
}

/// Reader side of one participant connection
struct StreamConnection {
    id: u64,
    addr: SocketAddr,
    agent: Option<Arc<str>>,
    frames: FrameSender,
    events: mpsc::UnboundedSender<StreamEvent>,
    current_tick: watch::Receiver<u64>,
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    events: mpsc::UnboundedSender<StreamEvent>,
    current_tick: watch::Receiver<u64>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let (reader, writer) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(writer, frames_rx));

    let mut connection = StreamConnection {
        id,
        addr,
        agent: None,
        frames: frames_tx,
        events,
        current_tick,
    };

    match connection.serve(reader).await {
        Ok(()) => debug!("Connection {} from {} closed", id, addr),
        Err(e) => error!("Dropping connection {} from {}: {}", id, addr, e),
    }

    if let Some(agent) = connection.agent.take() {
        let _ = connection.events.send(StreamEvent::Left {
            agent,
            connection: id,
        });
    }
}

impl StreamConnection {
    async fn serve<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<(), HarnessError> {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = tokio::select! {
                // The harness run is over
                _ = self.events.closed() => return Ok(()),
                read = reader.read(&mut chunk) => read?,
            };

            if n == 0 {
                return Ok(());
            }

            buffer.extend(&chunk[..n]);
            while let Some(message) = buffer.next_message::<OutboundMessage>()? {
                self.handle(message)?;
            }
        }
    }

    fn handle(&mut self, message: OutboundMessage) -> Result<(), HarnessError> {
        let received_at = Instant::now();

        match (self.agent.clone(), message) {
            (None, OutboundMessage::Handshake { agent, greeting }) => {
                debug!("Handshake from {} at {}: {}", agent, self.addr, greeting);

                let agent: Arc<str> = Arc::from(agent);
                self.agent = Some(Arc::clone(&agent));
                self.emit(StreamEvent::Joined {
                    agent,
                    endpoint: StreamEndpoint {
                        connection: self.id,
                        addr: self.addr,
                        frames: self.frames.clone(),
                    },
                });
                Ok(())
            }

            (None, _) => Err(ProtocolError::InvalidMessage(
                "first record of a connection must be a handshake".to_string(),
            )
            .into()),

            (Some(agent), OutboundMessage::Handshake { .. }) => Err(ProtocolError::InvalidMessage(
                format!("second handshake from {}", agent),
            )
            .into()),

            (Some(agent), OutboundMessage::Mutations { tick, commands, .. }) => {
                self.emit(StreamEvent::Batch {
                    agent,
                    connection: self.id,
                    tick,
                    commands: commands.len(),
                    received_at,
                });
                Ok(())
            }

            (
                Some(agent),
                OutboundMessage::Request {
                    request_id,
                    method,
                    arguments,
                    ..
                },
            ) => {
                let results = self.answer(&agent, &method, arguments);
                let frame = encode_line(&InboundMessage::response(request_id, results))?;
                if self.frames.send(frame.into()).is_err() {
                    debug!("Connection {} closed before response {}", self.id, request_id);
                }
                Ok(())
            }
        }
    }

    fn answer(&self, agent: &str, method: &str, arguments: Vec<Value>) -> Value {
        match method {
            "ping" => Value::Array(arguments),
            "tick" => json!(*self.current_tick.borrow()),
            other => {
                warn!("Unknown request {} from {}", other, agent);
                Value::Null
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            debug!("Harness gone, dropping event of connection {}", self.id);
        }
    }
}

/// Writer side of one participant connection
async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Arc<[u8]>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Failed to write frame: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}
