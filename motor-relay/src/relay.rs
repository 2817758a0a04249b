//! Connection lifecycle: open, message, close.
//!
//! ```text
//! CONNECTING ──open()──► OPEN ──close()──► CLOSED
//!      └──────────────close()──────────────┘
//! ```
//!
//! The [`StateStore`] and [`PresenceRegistry`] sit behind one mutex. Each
//! lifecycle step takes it once, mutates, enqueues its broadcasts, and
//! releases it. Enqueueing is non-blocking, so no socket I/O happens under
//! the lock, and every snapshot or count a peer receives is queued in the
//! same order the mutations happened.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::broadcast::{BroadcastHub, Frame, HubStats};
use crate::error::ProtocolError;
use crate::presence::{Peer, PeerId, PresenceRegistry};
use crate::protocol::Message;
use crate::router;
use crate::state::{SharedState, StateStore};

/// Relay-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub peers_evicted: u64,
    pub active_peers: usize,
}

struct Shared {
    store: StateStore,
    presence: PresenceRegistry,
}

/// The hub all sessions share.
pub struct Relay {
    shared: Mutex<Shared>,
    hub: BroadcastHub,
    outbox_capacity: usize,
}

impl Relay {
    /// `outbox_capacity` frames may queue per peer before it is evicted.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                store: StateStore::new(),
                presence: PresenceRegistry::new(),
            }),
            hub: BroadcastHub::new(),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Start a session for a connection whose upgrade was accepted.
    pub fn session(self: &Arc<Self>, address: impl Into<String>) -> Session {
        Session {
            relay: Arc::clone(self),
            peer_id: PeerId::generate(),
            address: address.into(),
            state: SessionState::Connecting,
            eviction: None,
        }
    }

    pub async fn snapshot(&self) -> SharedState {
        self.shared.lock().await.store.read()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.lock().await.presence.count()
    }

    pub async fn stats(&self) -> RelayStats {
        let active_peers = self.peer_count().await;
        let HubStats {
            frames_delivered,
            frames_dropped,
            peers_evicted,
        } = self.hub.stats();
        RelayStats {
            frames_delivered,
            frames_dropped,
            peers_evicted,
            active_peers,
        }
    }
}

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Outcome of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Cursor event forwarded to `recipients` other peers.
    Relayed { recipients: usize },
    /// Command applied; the new state went to `recipients` peers.
    StateUpdated { state: SharedState, recipients: usize },
    Ignored,
}

/// One connection's view of the relay.
pub struct Session {
    relay: Arc<Relay>,
    peer_id: PeerId,
    address: String,
    state: SessionState,
    eviction: Option<Arc<Notify>>,
}

impl Session {
    pub fn id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resolves once the hub has evicted this peer. Never resolves for a
    /// session that was not opened.
    pub async fn evicted(&self) {
        match &self.eviction {
            Some(signal) => signal.notified().await,
            None => std::future::pending().await,
        }
    }

    /// Register the peer, queue its join snapshot and announce the new count.
    ///
    /// Returns the peer's outbox, or `None` if the session was not
    /// `Connecting`. The outbox yields `None` once the peer is deregistered
    /// or evicted.
    pub async fn open(&mut self) -> Option<mpsc::Receiver<Frame>> {
        if self.state != SessionState::Connecting {
            return None;
        }

        let (tx, rx) = mpsc::channel(self.relay.outbox_capacity);
        let relay = &self.relay;
        let mut guard = relay.shared.lock().await;
        let shared = &mut *guard;

        if let Some(displaced) = shared
            .presence
            .register(Peer::new(self.peer_id.clone(), self.address.clone(), tx))
        {
            log::warn!("Peer id {} was already registered; replaced", displaced.id);
        }

        let snapshot = Message::snapshot(shared.store.read(), Some(self.peer_id.clone()));
        if let Some(peer) = shared.presence.get_mut(&self.peer_id) {
            self.eviction = Some(peer.eviction_signal());
            relay.hub.send_to(peer, &snapshot);
        }

        let count = shared.presence.count();
        relay
            .hub
            .broadcast(&mut shared.presence, &Message::users(count), None);
        drop(guard);

        self.state = SessionState::Open;
        log::info!(
            "Peer connected: {} (id {}), {count} online",
            self.address,
            self.peer_id
        );
        Some(rx)
    }

    /// Route one inbound payload.
    ///
    /// Malformed payloads return an error and have no side effects.
    /// Anything received outside `Open`, or after the peer was evicted, is
    /// ignored.
    pub async fn handle_message(&self, raw: &[u8]) -> Result<Dispatch, ProtocolError> {
        if self.state != SessionState::Open {
            return Ok(Dispatch::Ignored);
        }

        let Some(message) = router::classify(raw, &self.peer_id)? else {
            log::debug!("Ignoring unrecognized message from peer {}", self.peer_id);
            return Ok(Dispatch::Ignored);
        };

        let relay = &self.relay;
        let mut guard = relay.shared.lock().await;
        let shared = &mut *guard;

        // An evicted peer is logically gone.
        if !shared
            .presence
            .get(&self.peer_id)
            .is_some_and(Peer::subscribed)
        {
            log::debug!("Ignoring message from evicted peer {}", self.peer_id);
            return Ok(Dispatch::Ignored);
        }

        let dispatch = match &message {
            Message::Cursor(_) => {
                // The sender draws its own cursor locally.
                let recipients =
                    relay
                        .hub
                        .broadcast(&mut shared.presence, &message, Some(&self.peer_id));
                log::trace!("Cursor from {} relayed to {recipients} peers", self.peer_id);
                Dispatch::Relayed { recipients }
            }
            Message::Command(update) => {
                let state = shared.store.apply(update);
                // Sender included: it must see the normalized value.
                let recipients = relay.hub.broadcast(
                    &mut shared.presence,
                    &Message::snapshot(state, None),
                    None,
                );
                log::debug!(
                    "Peer {} set speed={} forward={}",
                    self.peer_id,
                    state.speed,
                    state.forward
                );
                Dispatch::StateUpdated { state, recipients }
            }
            // The router only produces cursor and command events.
            _ => Dispatch::Ignored,
        };
        Ok(dispatch)
    }

    /// Deregister the peer, then announce the departure and the new count.
    ///
    /// Idempotent. Closing a `Connecting` session broadcasts nothing.
    pub async fn close(&mut self) {
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;
        if !was_open {
            return;
        }

        let relay = &self.relay;
        let mut guard = relay.shared.lock().await;
        let shared = &mut *guard;

        // Dropping the peer closes its outbox.
        shared.presence.deregister(&self.peer_id);
        relay.hub.broadcast(
            &mut shared.presence,
            &Message::user_disconnected(self.peer_id.clone()),
            None,
        );
        let count = shared.presence.count();
        relay
            .hub
            .broadcast(&mut shared.presence, &Message::users(count), None);
        drop(guard);

        log::info!(
            "Peer disconnected: {} (id {}), {count} online",
            self.address,
            self.peer_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(64))
    }

    async fn join(relay: &Arc<Relay>, address: &str) -> (Session, mpsc::Receiver<Frame>) {
        let mut session = relay.session(address);
        let rx = session.open().await.unwrap();
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(frame.as_str()).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_open_sends_snapshot_then_count() {
        let relay = relay();
        let (session, mut rx) = join(&relay, "10.0.0.1").await;

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(
            drain(&mut rx),
            vec![
                json!({"type": "state", "speed": 0, "forward": true, "userId": session.id().as_str()}),
                json!({"type": "users", "count": 1}),
            ]
        );
        assert_eq!(relay.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_count_reaches_everyone() {
        let relay = relay();
        let (_a, mut rx_a) = join(&relay, "10.0.0.1").await;
        drain(&mut rx_a);

        let (b, mut rx_b) = join(&relay, "10.0.0.2").await;
        assert_eq!(drain(&mut rx_a), vec![json!({"type": "users", "count": 2})]);

        let frames = drain(&mut rx_b);
        assert_eq!(frames[0]["type"], "state");
        assert_eq!(frames[0]["userId"], b.id().as_str());
        assert_eq!(frames[1], json!({"type": "users", "count": 2}));
    }

    #[tokio::test]
    async fn test_command_broadcasts_normalized_state_to_all() {
        let relay = relay();
        let (a, mut rx_a) = join(&relay, "10.0.0.1").await;
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let dispatch = a
            .handle_message(br#"{"type":"command","speed":"42","forward":false}"#)
            .await
            .unwrap();
        let expected = SharedState { speed: 42, forward: false };
        assert_eq!(
            dispatch,
            Dispatch::StateUpdated { state: expected, recipients: 2 }
        );

        let frame = json!({"type": "state", "speed": 42, "forward": false});
        assert_eq!(drain(&mut rx_a), vec![frame.clone()]);
        assert_eq!(drain(&mut rx_b), vec![frame]);
        assert_eq!(relay.snapshot().await, expected);
    }

    #[tokio::test]
    async fn test_cursor_skips_sender() {
        let relay = relay();
        let (a, mut rx_a) = join(&relay, "10.0.0.1").await;
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        let (_c, mut rx_c) = join(&relay, "10.0.0.3").await;
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            drain(rx);
        }

        let dispatch = a
            .handle_message(br#"{"type":"cursor","x":10,"y":20}"#)
            .await
            .unwrap();
        assert_eq!(dispatch, Dispatch::Relayed { recipients: 2 });

        let frame = json!({"type": "cursor", "id": a.id().as_str(), "x": 10, "y": 20});
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![frame.clone()]);
        assert_eq!(drain(&mut rx_c), vec![frame]);
    }

    #[tokio::test]
    async fn test_close_announces_departure_then_count() {
        let relay = relay();
        let (mut a, mut rx_a) = join(&relay, "10.0.0.1").await;
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        drain(&mut rx_b);

        a.close().await;
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(relay.peer_count().await, 1);

        assert_eq!(
            drain(&mut rx_b),
            vec![
                json!({"type": "user_disconnected", "id": a.id().as_str()}),
                json!({"type": "users", "count": 1}),
            ]
        );

        // The closed peer's outbox drains what it had and then ends.
        drain(&mut rx_a);
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let relay = relay();
        let (mut a, _rx_a) = join(&relay, "10.0.0.1").await;
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        drain(&mut rx_b);

        a.close().await;
        a.close().await;
        let departures = drain(&mut rx_b)
            .into_iter()
            .filter(|f| f["type"] == "user_disconnected")
            .count();
        assert_eq!(departures, 1);
    }

    #[tokio::test]
    async fn test_closed_session_cannot_reopen_or_send() {
        let relay = relay();
        let (mut a, _rx_a) = join(&relay, "10.0.0.1").await;
        assert!(a.open().await.is_none());

        a.close().await;
        assert!(a.open().await.is_none());
        assert_eq!(
            a.handle_message(br#"{"speed":9}"#).await.unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(relay.snapshot().await, SharedState::default());
    }

    #[tokio::test]
    async fn test_connecting_session_close_is_silent() {
        let relay = relay();
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        drain(&mut rx_b);

        let mut pending = relay.session("10.0.0.9");
        assert_eq!(pending.state(), SessionState::Connecting);
        assert_eq!(
            pending.handle_message(br#"{"speed":9}"#).await.unwrap(),
            Dispatch::Ignored
        );
        pending.close().await;

        assert_eq!(pending.state(), SessionState::Closed);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(relay.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_has_no_side_effects() {
        let relay = relay();
        let (a, mut rx_a) = join(&relay, "10.0.0.1").await;
        drain(&mut rx_a);

        assert!(a.handle_message(b"{not json").await.is_err());
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(a.state(), SessionState::Open);

        // Still usable afterwards.
        a.handle_message(br#"{"speed":3}"#).await.unwrap();
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_current_state() {
        let relay = relay();
        let (a, _rx_a) = join(&relay, "10.0.0.1").await;
        a.handle_message(br#"{"speed":"7","forward":false}"#)
            .await
            .unwrap();

        let (b, mut rx_b) = join(&relay, "10.0.0.2").await;
        assert_eq!(
            drain(&mut rx_b)[0],
            json!({"type": "state", "speed": 7, "forward": false, "userId": b.id().as_str()})
        );
    }

    #[tokio::test]
    async fn test_count_tracks_open_sessions() {
        let relay = relay();
        let (_observer, mut rx) = join(&relay, "10.0.0.1").await;

        let mut sessions = Vec::new();
        for i in 0..4 {
            let (s, _rx) = join(&relay, &format!("10.0.1.{i}")).await;
            sessions.push(s);
        }
        for s in sessions.iter_mut().take(2) {
            s.close().await;
        }

        let counts: Vec<u64> = drain(&mut rx)
            .iter()
            .filter(|f| f["type"] == "users")
            .map(|f| f["count"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5, 4, 3]);
        assert_eq!(relay.peer_count().await, 3);
    }

    #[tokio::test]
    async fn test_slow_peer_is_evicted_and_closed_normally() {
        let relay = Arc::new(Relay::new(2));
        let (mut slow, mut rx_slow) = join(&relay, "10.0.0.1").await;
        // Snapshot + count fill the outbox; the next count evicts.
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        drain(&mut rx_b);

        let stats = relay.stats().await;
        assert_eq!(stats.peers_evicted, 1);
        assert_eq!(stats.active_peers, 2);

        assert_eq!(drain(&mut rx_slow).len(), 2);
        assert!(rx_slow.recv().await.is_none());

        slow.close().await;
        assert_eq!(
            drain(&mut rx_b),
            vec![
                json!({"type": "user_disconnected", "id": slow.id().as_str()}),
                json!({"type": "users", "count": 1}),
            ]
        );
    }

    #[tokio::test]
    async fn test_evicted_peer_cannot_mutate_or_relay() {
        let relay = Arc::new(Relay::new(2));
        let (slow, _rx_slow) = join(&relay, "10.0.0.1").await;
        let (_b, mut rx_b) = join(&relay, "10.0.0.2").await;
        assert_eq!(relay.stats().await.peers_evicted, 1);
        drain(&mut rx_b);

        tokio::time::timeout(std::time::Duration::from_secs(1), slow.evicted())
            .await
            .expect("eviction should wake the session");

        assert_eq!(
            slow.handle_message(br#"{"type":"command","speed":99}"#)
                .await
                .unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(
            slow.handle_message(br#"{"type":"cursor","x":1,"y":2}"#)
                .await
                .unwrap(),
            Dispatch::Ignored
        );
        assert_eq!(relay.snapshot().await, SharedState::default());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_commands_converge() {
        let relay = relay();
        let (_observer, mut rx) = join(&relay, "10.0.0.1").await;
        drain(&mut rx);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let (session, _rx) = join(&relay, &format!("10.0.2.{i}")).await;
            tasks.push(tokio::spawn(async move {
                let payload = format!(r#"{{"speed":{i}}}"#);
                session.handle_message(payload.as_bytes()).await.unwrap();
                session
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // The last snapshot queued always matches the store.
        let last_state = drain(&mut rx)
            .into_iter()
            .filter(|f| f["type"] == "state")
            .last()
            .unwrap();
        assert_eq!(last_state["speed"], relay.snapshot().await.speed);
    }
}
