//! Simulated datagram participants
//!
//! Stand-ins for real participants when measuring the harness itself: each
//! one handshakes, then answers every tick push with an empty mutation
//! batch after a fixed delay plus random jitter.

use crate::error::HarnessError;
use log::{debug, info, warn};
use protocol::{decode, encode, Datagram, InboundMessage};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Reply timing of a simulated participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyDelay {
    /// Fixed part of every reply delay
    pub base: Duration,
    /// Upper bound of the uniformly random extra delay
    pub jitter: Duration,
}

impl ReplyDelay {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            jitter: Duration::ZERO,
        }
    }

    /// Picks the delay of one reply
    pub fn sample(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }

        let jitter_us = self.jitter.as_micros() as u64;
        self.base + Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_us))
    }
}

/// A UDP participant that echoes every tick
pub struct SimulatedParticipant {
    socket: Arc<UdpSocket>,
    agent_id: Arc<str>,
    delay: ReplyDelay,
}

impl SimulatedParticipant {
    /// Binds a local socket and sends the handshake to `server`
    pub async fn connect(
        server: SocketAddr,
        agent_id: &str,
        delay: ReplyDelay,
    ) -> Result<Self, HarnessError> {
        let local: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let handshake = Datagram::handshake(agent_id, format!("Hello from {} !", agent_id));
        socket.send(&encode(&handshake)?).await?;
        debug!("Participant {} handshaked with {}", agent_id, server);

        Ok(Self {
            socket: Arc::new(socket),
            agent_id: Arc::from(agent_id),
            delay,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Answers tick pushes until the socket fails
    ///
    /// Replies are sent from their own tasks, so a long delay never holds
    /// back reading the next tick.
    pub async fn run(self) -> Result<(), HarnessError> {
        let mut buffer = vec![0u8; 65_507];

        loop {
            let len = self.socket.recv(&mut buffer).await?;

            let tick = match decode::<InboundMessage>(&buffer[..len])
                .and_then(InboundMessage::into_tick)
            {
                Ok(notification) => notification.tick,
                Err(e) => {
                    warn!("Participant {} ignoring datagram: {}", self.agent_id, e);
                    continue;
                }
            };

            let reply = encode(&Datagram::mutation(self.agent_id.as_ref(), tick, &[]))?;
            let delay = self.delay.sample();

            if delay.is_zero() {
                self.socket.send(&reply).await?;
                continue;
            }

            let socket = Arc::clone(&self.socket);
            let agent_id = Arc::clone(&self.agent_id);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send(&reply).await {
                    warn!("Participant {} failed to answer tick {}: {}", agent_id, tick, e);
                }
            });
        }
    }
}

/// Connects `count` participants named `<prefix>-<n>` and runs each on its
/// own task
pub async fn spawn_fleet(
    server: SocketAddr,
    prefix: &str,
    count: usize,
    delay: ReplyDelay,
) -> Result<Vec<JoinHandle<Result<(), HarnessError>>>, HarnessError> {
    let mut handles = Vec::with_capacity(count);

    for n in 0..count {
        let agent_id = format!("{}-{}", prefix, n);
        let participant = SimulatedParticipant::connect(server, &agent_id, delay).await?;
        handles.push(tokio::spawn(participant.run()));
    }

    info!("Spawned {} simulated participants", count);
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DatagramKind;
    use tokio_test::assert_ok;

    #[test]
    fn test_delay_sampling_stays_in_bounds() {
        let delay = ReplyDelay {
            base: Duration::from_millis(3),
            jitter: Duration::from_millis(2),
        };

        for _ in 0..1000 {
            let sampled = delay.sample();
            assert!(sampled >= Duration::from_millis(3));
            assert!(sampled <= Duration::from_millis(5));
        }

        let fixed = ReplyDelay::fixed(Duration::from_millis(4));
        assert_eq!(fixed.sample(), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_participant_handshakes_and_echoes_ticks() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let participant = SimulatedParticipant::connect(
            server.local_addr().unwrap(),
            "sim-1",
            ReplyDelay::default(),
        )
        .await
        .unwrap();

        let mut buffer = [0u8; 1024];
        let (len, addr) = server.recv_from(&mut buffer).await.unwrap();
        let handshake: Datagram = assert_ok!(decode(&buffer[..len]));
        assert_eq!(handshake.kind, DatagramKind::Handshake);
        assert_eq!(handshake.agent_id, "sim-1");

        let task = tokio::spawn(participant.run());

        let push = encode(&InboundMessage::tick(9, serde_json::json!({}))).unwrap();
        server.send_to(&push, addr).await.unwrap();

        let (len, _) = server.recv_from(&mut buffer).await.unwrap();
        let reply: Datagram = assert_ok!(decode(&buffer[..len]));
        assert_eq!(reply.kind, DatagramKind::Mutation);
        assert_eq!(reply.turn(), Some(9));
        assert!(reply.mutations().unwrap().is_empty());

        task.abort();
    }
}
