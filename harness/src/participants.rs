//! Participant registry for the harness
//!
//! This module tracks who has joined a harness run and where to reach them:
//! - Join and rejoin on handshake, capped at the expected participant count
//! - Endpoint lookup for tick broadcasts
//! - Reply counting and last-activity tracking
//!
//! The endpoint type is whatever the transport needs to reach a participant:
//! a socket address for datagrams, a frame queue for streams.

use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A joined participant and its activity over the run
///
/// Each participant keeps:
/// - The id it announced and the endpoint ticks are sent to
/// - When it was last heard from, for idle warnings
/// - How many replies it sent, for the run summary
#[derive(Debug)]
pub struct Participant<E> {
    /// Id announced in the handshake
    pub id: Arc<str>,
    /// Where tick pushes are sent
    pub endpoint: E,
    /// Last time anything was received from this participant
    pub last_seen: Instant,
    /// Replies received over the whole run
    pub replies: u64,
}

impl<E> Participant<E> {
    /// Creates a participant reachable at `endpoint`
    ///
    /// The participant counts as just heard from and has no replies yet.
    pub fn new(id: Arc<str>, endpoint: E) -> Self {
        Self {
            id,
            endpoint,
            last_seen: Instant::now(),
            replies: 0,
        }
    }

    /// Checks if the participant has gone quiet
    ///
    /// Returns true if nothing was received within `timeout`. Slow replies
    /// still count as activity; only silence makes a participant idle.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// All participants of a run, keyed by id
///
/// The registry decides when a run may start: ticking begins once the
/// expected number of distinct ids has joined. Ids beyond that are turned
/// away, while known ids may rejoin from a new endpoint at any time.
#[derive(Debug)]
pub struct ParticipantRegistry<E> {
    participants: HashMap<Arc<str>, Participant<E>>,
    /// Number of participants the run waits for
    expected: usize,
}

impl<E> ParticipantRegistry<E> {
    /// Creates an empty registry waiting for `expected` participants
    pub fn new(expected: usize) -> Self {
        Self {
            participants: HashMap::with_capacity(expected),
            expected,
        }
    }

    /// Registers a participant, or updates the endpoint of one that rejoins
    ///
    /// A rejoin keeps the participant's reply count and refreshes its
    /// activity. Returns `None` if a new id arrives while the run is
    /// already full.
    pub fn join(&mut self, id: &str, endpoint: E) -> Option<Arc<str>> {
        if let Some(participant) = self.participants.get_mut(id) {
            info!("Participant {} rejoined", id);
            participant.endpoint = endpoint;
            participant.last_seen = Instant::now();
            return Some(Arc::clone(&participant.id));
        }

        if self.is_full() {
            return None;
        }

        let id: Arc<str> = Arc::from(id);
        info!(
            "Participant {} joined ({}/{})",
            id,
            self.participants.len() + 1,
            self.expected
        );
        self.participants
            .insert(Arc::clone(&id), Participant::new(Arc::clone(&id), endpoint));
        Some(id)
    }

    /// Removes a participant; returns true if it was registered
    ///
    /// Used when a stream connection goes away. Its unanswered ticks are
    /// left in the ledger and expire like any other lost reply.
    pub fn leave(&mut self, id: &str) -> bool {
        if self.participants.remove(id).is_some() {
            info!("Participant {} left", id);
            true
        } else {
            false
        }
    }

    /// Counts a reply from `id`; returns false for unknown participants
    ///
    /// Any reply counts as activity, whether or not it matches a tick.
    pub fn record_reply(&mut self, id: &str) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.last_seen = Instant::now();
                participant.replies += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Participant<E>> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    /// Ids of participants silent for longer than `timeout`
    pub fn idle(&self, timeout: Duration) -> Vec<Arc<str>> {
        self.participants
            .values()
            .filter(|participant| participant.is_idle(timeout))
            .map(|participant| Arc::clone(&participant.id))
            .collect()
    }

    pub fn total_replies(&self) -> u64 {
        self.participants.values().map(|p| p.replies).sum()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// All expected participants have joined
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.expected
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

impl<E: Clone> ParticipantRegistry<E> {
    /// Ids and endpoints of every participant, for broadcasting
    ///
    /// Returns a snapshot so the caller may send without borrowing the
    /// registry. The order is unspecified.
    pub fn endpoints(&self) -> Vec<(Arc<str>, E)> {
        self.participants
            .values()
            .map(|participant| (Arc::clone(&participant.id), participant.endpoint.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_join_until_full() {
        let mut registry = ParticipantRegistry::new(2);

        assert!(registry.join("agent-1", addr(9001)).is_some());
        assert!(!registry.is_full());
        assert!(registry.join("agent-2", addr(9002)).is_some());
        assert!(registry.is_full());

        assert!(registry.join("agent-3", addr(9003)).is_none());
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains("agent-3"));
    }

    #[test]
    fn test_rejoin_updates_endpoint() {
        let mut registry = ParticipantRegistry::new(1);
        registry.join("agent-1", addr(9001));

        let id = registry.join("agent-1", addr(9100)).unwrap();

        assert_eq!(&*id, "agent-1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("agent-1").unwrap().endpoint, addr(9100));
    }

    #[test]
    fn test_replies_and_leave() {
        let mut registry = ParticipantRegistry::new(2);
        registry.join("agent-1", addr(9001));
        registry.join("agent-2", addr(9002));

        assert!(registry.record_reply("agent-1"));
        assert!(registry.record_reply("agent-1"));
        registry.join("agent-1", addr(9101));
        assert!(registry.record_reply("agent-2"));
        assert!(!registry.record_reply("agent-9"));
        assert_eq!(registry.get("agent-1").unwrap().replies, 2);
        assert_eq!(registry.total_replies(), 3);

        assert!(registry.leave("agent-1"));
        assert!(!registry.leave("agent-1"));
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn test_idle_participants() {
        let mut registry = ParticipantRegistry::new(2);
        registry.join("agent-1", addr(9001));
        registry.join("agent-2", addr(9002));

        if let Some(participant) = registry.participants.get_mut("agent-1") {
            participant.last_seen = Instant::now() - Duration::from_secs(5);
        }

        let idle = registry.idle(Duration::from_secs(1));
        assert_eq!(idle.len(), 1);
        assert_eq!(&*idle[0], "agent-1");
    }
}
