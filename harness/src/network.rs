//! Datagram load harness: UDP communications and tick loop coordination
//!
//! This module drives the datagram flavour of the load test, including:
//! - Participant registration from handshake datagrams
//! - Tick pushes at a fixed rate once every expected participant joined
//! - Matching mutation replies to the tick they answer
//! - Periodic latency reports and the end-of-run summary
//!
//! Receiving runs on its own task so arrival times are taken as soon as a
//! datagram is read. Sending and all bookkeeping happen on the main loop.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::metrics::{HarnessSummary, LatencyReport, TickLedger};
use crate::participants::ParticipantRegistry;
use crate::schedule::{shutdown_requested, ClockEvent, ShutdownHandle, TickClock};
use log::{debug, error, info, warn};
use protocol::{decode, encode, Datagram, DatagramKind, InboundMessage};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Largest datagram the harness accepts
const MAX_DATAGRAM_LEN: usize = 65_507;

/// Participant datagram handed from the receiver task to the main loop
///
/// The receiver decodes datagrams as they arrive and forwards them with
/// their source address. Undecodable datagrams never get this far.
#[derive(Debug)]
pub struct ReceivedDatagram {
    /// Decoded participant record
    pub datagram: Datagram,
    /// Address the datagram came from
    pub addr: SocketAddr,
    /// Taken as soon as the datagram is read, before any queueing
    pub received_at: Instant,
}

/// Drives N datagram participants at a fixed tick rate and measures how
/// fast they answer each tick
///
/// The harness owns the registry of joined participants and the ledger of
/// unanswered sends. Each participant's send time is taken when its own
/// tick datagram has been handed to the socket, so a participant late in
/// the broadcast order is not charged for the sends before it.
pub struct LoadHarness {
    socket: Arc<UdpSocket>,
    config: HarnessConfig,
    participants: ParticipantRegistry<SocketAddr>,
    ledger: TickLedger,
    tick: u64,
    subscribers: Vec<mpsc::UnboundedSender<LatencyReport>>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,

    // Communication channels
    received_tx: mpsc::UnboundedSender<ReceivedDatagram>,
    received_rx: mpsc::UnboundedReceiver<ReceivedDatagram>,
}

impl LoadHarness {
    /// Validates the configuration and binds the harness socket
    ///
    /// Nothing is sent or received until `run` is called. Bind to port 0
    /// and read `local_addr` to let the OS pick a free port.
    pub async fn bind(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Harness listening on {} (udp)", socket.local_addr()?);

        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = ShutdownHandle::new();

        Ok(Self {
            socket,
            participants: ParticipantRegistry::new(config.participants),
            ledger: TickLedger::new(&config),
            config,
            tick: 0,
            subscribers: Vec::new(),
            shutdown,
            shutdown_rx,
            received_tx,
            received_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HarnessError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Receives every latency report published during the run
    ///
    /// Reports arrive once per report interval, followed by nothing once
    /// the run ends. Dropped receivers are forgotten at the next report.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LatencyReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Spawns task that continuously listens for participant datagrams
    ///
    /// The task stamps each datagram on arrival and stops once the main
    /// loop drops its receiving end.
    fn spawn_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let received_tx = self.received_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];

            loop {
                let (len, addr) = tokio::select! {
                    _ = received_tx.closed() => break,
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            error!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };
                let received_at = Instant::now();

                match decode::<Datagram>(&buffer[..len]) {
                    Ok(datagram) => {
                        let received = ReceivedDatagram {
                            datagram,
                            addr,
                            received_at,
                        };
                        if received_tx.send(received).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping datagram from {}: {}", addr, e),
                }
            }
        });
    }

    /// Applies one participant datagram to the registry and the ledger
    ///
    /// Handshakes register or re-register a participant. Mutations are
    /// matched to the tick they answer; replies from unknown participants
    /// are logged and dropped.
    fn handle_datagram(&mut self, received: ReceivedDatagram) {
        let ReceivedDatagram {
            datagram,
            addr,
            received_at,
        } = received;

        match datagram.kind {
            DatagramKind::Handshake => {
                debug!(
                    "Handshake from {} at {}: {}",
                    datagram.agent_id,
                    addr,
                    datagram.greetings().unwrap_or_default()
                );

                if self.participants.join(&datagram.agent_id, addr).is_none() {
                    warn!(
                        "All {} participants already joined, ignoring {} from {}",
                        self.participants.expected(),
                        datagram.agent_id,
                        addr
                    );
                }
            }

            DatagramKind::Mutation => {
                let Some(turn) = datagram.turn() else {
                    warn!("Mutation from {} without a turn", datagram.agent_id);
                    return;
                };

                if !self.participants.record_reply(&datagram.agent_id) {
                    warn!(
                        "Mutation from unregistered participant {} at {}",
                        datagram.agent_id, addr
                    );
                    return;
                }

                if let Some(sample) = self.ledger.record_reply(&datagram.agent_id, turn, received_at) {
                    if sample.timed_out {
                        debug!(
                            "Participant {} answered tick {} in {:.2}ms",
                            sample.participant,
                            turn,
                            sample.latency.as_secs_f64() * 1000.0
                        );
                    }
                }
            }
        }
    }

    /// Sends the current tick to every participant and stamps each send
    ///
    /// A participant is stamped right after its own datagram leaves, so
    /// its latency excludes the time spent sending to the others. A failed
    /// send is logged and leaves that participant unstamped for the tick.
    async fn send_tick(&mut self) -> Result<(), HarnessError> {
        let tick = self.tick;
        let endpoints = self.participants.endpoints();

        let bytes = encode(&InboundMessage::tick(tick, snapshot(endpoints.len())))?;

        for (id, addr) in endpoints {
            match self.socket.send_to(&bytes, addr).await {
                Ok(_) => self.ledger.record_send(&id, tick, Instant::now()),
                Err(e) => error!("Failed to send tick {} to {} at {}: {}", tick, id, addr, e),
            }
        }

        self.tick += 1;

        let lost = self.ledger.expire(self.tick);
        if lost > 0 {
            debug!("{} sends expired unanswered before tick {}", lost, self.tick);
        }

        if self.tick % self.config.expiry_ticks() == 0 {
            debug!(
                "Tick {}: {} participants, {} replies in flight",
                self.tick,
                self.participants.len(),
                self.ledger.in_flight()
            );
        }

        Ok(())
    }

    /// Logs the current latency window and hands it to every subscriber
    ///
    /// While ticking, participants silent for a whole report interval are
    /// called out as well.
    fn publish_report(&mut self, ticking: bool) {
        let report = self.ledger.report();
        info!("{}", report);

        if ticking {
            for id in self.participants.idle(self.config.report_interval) {
                warn!(
                    "Participant {} has been silent for over {:?}",
                    id, self.config.report_interval
                );
            }
        }

        self.subscribers
            .retain(|subscriber| subscriber.send(report.clone()).is_ok());
    }

    /// Main harness loop: waits for every participant, then ticks until
    /// the tick limit is reached and drained, or until shut down
    pub async fn run(mut self) -> Result<HarnessSummary, HarnessError> {
        self.spawn_receiver();

        let mut clock = TickClock::new(&self.config);
        let mut shutdown = self.shutdown_rx.clone();

        info!("Waiting for {} participants", self.config.participants);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Harness shutting down");
                    break;
                },

                // Handle participant datagrams
                received = self.received_rx.recv() => {
                    let Some(received) = received else { break };
                    self.handle_datagram(received);

                    if self.participants.is_full() && !clock.is_ticking() && clock.ticks() == 0 {
                        info!(
                            "All {} participants joined, ticking every {:?}",
                            self.participants.len(),
                            self.config.tick_period()
                        );
                        clock.start();
                    }
                },

                // Handle timer events
                event = clock.next() => match event {
                    ClockEvent::Tick => self.send_tick().await?,
                    ClockEvent::Report => self.publish_report(clock.is_ticking()),
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

/// World state pushed with every tick
pub(crate) fn snapshot(participants: usize) -> Value {
    json!({ "Participants": participants })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Command;

    fn test_config(participants: usize) -> HarnessConfig {
        HarnessConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            participants,
            ticks_per_second: 20,
            ..HarnessConfig::default()
        }
    }

    fn datagram(datagram: Datagram, port: u16) -> ReceivedDatagram {
        ReceivedDatagram {
            datagram,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            received_at: Instant::now(),
        }
    }

    async fn participant_socket() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = HarnessConfig {
            participants: 0,
            ..test_config(1)
        };

        assert!(matches!(
            LoadHarness::bind(config).await,
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_handshakes_register_participants() {
        let mut harness = LoadHarness::bind(test_config(2)).await.unwrap();

        harness.handle_datagram(datagram(Datagram::handshake("agent-1", "hi"), 9001));
        harness.handle_datagram(datagram(Datagram::handshake("agent-2", "hi"), 9002));
        harness.handle_datagram(datagram(Datagram::handshake("agent-3", "hi"), 9003));

        assert_eq!(harness.participants.len(), 2);
        assert!(harness.participants.is_full());
        assert!(!harness.participants.contains("agent-3"));
    }

    #[tokio::test]
    async fn test_tick_stamps_every_participant() {
        let mut harness = LoadHarness::bind(test_config(2)).await.unwrap();
        let (first, first_port) = participant_socket().await;
        let (second, second_port) = participant_socket().await;

        harness.handle_datagram(datagram(Datagram::handshake("agent-1", "hi"), first_port));
        harness.handle_datagram(datagram(Datagram::handshake("agent-2", "hi"), second_port));

        let before = Instant::now();
        harness.send_tick().await.unwrap();

        let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
        for socket in [&first, &second] {
            let (len, _) = socket.recv_from(&mut buffer).await.unwrap();
            assert_eq!(
                decode::<InboundMessage>(&buffer[..len]).unwrap(),
                InboundMessage::tick(0, snapshot(2))
            );
        }
        assert_eq!(harness.tick, 1);
        assert_eq!(harness.ledger.in_flight(), 2);

        // No stamp predates the tick
        let answered = Instant::now();
        for id in ["agent-1", "agent-2"] {
            let sample = harness.ledger.record_reply(id, 0, answered).unwrap();
            assert!(sample.latency <= answered - before);
        }
    }

    #[tokio::test]
    async fn test_replies_are_matched_to_ticks() {
        let mut harness = LoadHarness::bind(test_config(1)).await.unwrap();

        let (_participant, port) = participant_socket().await;
        harness.handle_datagram(datagram(Datagram::handshake("agent-1", "hi"), port));
        harness.send_tick().await.unwrap();

        let steer = [Command::new("steer", json!([1, 0]))];
        harness.handle_datagram(datagram(Datagram::mutation("agent-1", 0, &steer), port));
        harness.handle_datagram(datagram(Datagram::mutation("agent-1", 0, &steer), port));
        harness.handle_datagram(datagram(Datagram::mutation("agent-9", 0, &steer), 9009));

        let report = harness.ledger.report();
        assert_eq!(report.samples, 1);
        assert_eq!(report.timeouts, 0);
        assert_eq!(harness.ledger.unmatched(), 1);
        assert_eq!(harness.participants.total_replies(), 2);
    }
}
