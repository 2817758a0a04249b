//! Presence registry: who is connected right now.
//!
//! Each [`Peer`] owns the sending half of its outbox. Dropping the peer (on
//! deregistration or eviction) closes the outbox, which is how the
//! connection task learns it should stop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::broadcast::Frame;

/// Opaque session identifier, assigned once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Random id (UUID v4, 32 hex digits). Uniqueness rests on entropy alone.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A connected peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    /// Remote network address as reported by the transport.
    pub address: String,
    outbox: Option<mpsc::Sender<Frame>>,
    evicted: Arc<Notify>,
}

impl Peer {
    pub fn new(id: PeerId, address: impl Into<String>, outbox: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            address: address.into(),
            outbox: Some(outbox),
            evicted: Arc::new(Notify::new()),
        }
    }

    /// Whether broadcasts still reach this peer.
    pub fn subscribed(&self) -> bool {
        self.outbox.is_some()
    }

    pub(crate) fn outbox(&self) -> Option<&mpsc::Sender<Frame>> {
        self.outbox.as_ref()
    }

    /// Signalled once, when the hub evicts this peer.
    pub fn eviction_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.evicted)
    }

    /// Detach the outbox and wake the peer's connection task. The peer stays
    /// registered until that task closes its session.
    pub(crate) fn unsubscribe(&mut self) {
        if self.outbox.take().is_some() {
            self.evicted.notify_one();
        }
    }
}

/// The set of registered peers, keyed by id.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns the peer it displaced if the id was already taken.
    pub fn register(&mut self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.id.clone(), peer)
    }

    pub fn deregister(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    /// All registered peers, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }
}
