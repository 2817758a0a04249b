//! Fan-out of encoded frames to registered peers.
//!
//! A message is serialized once and the resulting frame is cloned into each
//! recipient's bounded outbox with `try_send`, so a broadcast never waits on
//! a socket. A peer whose outbox is full or closed is evicted: its outbox is
//! detached, it receives nothing further, and its connection task winds down
//! through the normal close path.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::ProtocolError;
use crate::presence::{Peer, PeerId, PresenceRegistry};
use crate::protocol::Message;

/// Encoded text frame, cheap to clone.
pub type Frame = Utf8Bytes;

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub peers_evicted: u64,
}

/// Lock-free hub counters.
#[derive(Debug, Default)]
struct AtomicHubStats {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    peers_evicted: AtomicU64,
}

/// Delivers messages to one peer or to every registered peer.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    stats: AtomicHubStats,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a message into a shareable frame.
    pub fn encode(msg: &Message) -> Result<Frame, ProtocolError> {
        msg.encode().map(Frame::from)
    }

    /// Point-to-point delivery. Returns whether the frame was queued.
    pub fn send_to(&self, peer: &mut Peer, msg: &Message) -> bool {
        match Self::encode(msg) {
            Ok(frame) => self.deliver(peer, frame),
            Err(e) => {
                log::error!("Dropping {} message for peer {}: {e}", msg.kind(), peer.id);
                false
            }
        }
    }

    /// Deliver to every registered peer except `excluding`.
    ///
    /// Returns the number of peers the frame was queued for.
    pub fn broadcast(
        &self,
        presence: &mut PresenceRegistry,
        msg: &Message,
        excluding: Option<&PeerId>,
    ) -> usize {
        let frame = match Self::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping {} broadcast: {e}", msg.kind());
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in presence.all_mut() {
            if excluding == Some(&peer.id) {
                continue;
            }
            if self.deliver(peer, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Current counters.
    pub fn stats(&self) -> HubStats {
        HubStats {
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            peers_evicted: self.stats.peers_evicted.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, peer: &mut Peer, frame: Frame) -> bool {
        // Already evicted; waiting for its connection to close.
        let Some(outbox) = peer.outbox() else {
            return false;
        };

        match outbox.try_send(frame) {
            Ok(()) => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Peer {} ({}) outbox full, evicting", peer.id, peer.address);
                self.evict(peer);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Peer {} outbox closed, evicting", peer.id);
                self.evict(peer);
                false
            }
        }
    }

    fn evict(&self, peer: &mut Peer) {
        peer.unsubscribe();
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        self.stats.peers_evicted.fetch_add(1, Ordering::Relaxed);
    }
}
