//! # motor-relay — Real-time state relay for motor control peers
//!
//! Lets a browser control UI and one or more actuator devices share a
//! single motor state record and exchange cursor positions over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ Browser UI  │ ◄─────────────────► │ RelayServer                  │
//! └─────────────┘     JSON frames     │   │                          │
//! ┌─────────────┐                     │   ▼                          │
//! │ Actuator    │ ◄─────────────────► │ Session (per connection)     │
//! └─────────────┘                     │   │                          │
//!                                     │   ▼                          │
//!                                     │ Relay ── Mutex ─┬─ StateStore│
//!                                     │                 └─ Presence  │
//!                                     │   │                          │
//!                                     │   ▼                          │
//!                                     │ BroadcastHub (fan-out)       │
//!                                     └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages (`type`-tagged)
//! - [`router`] — inbound payload classification
//! - [`state`] — the shared motor state and its coercion rules
//! - [`presence`] — connected peers and their outboxes
//! - [`broadcast`] — fan-out with per-peer bounded outboxes
//! - [`relay`] — per-connection lifecycle (open / message / close)
//! - [`server`] — WebSocket listener and per-connection task
//! - [`upgrade`] — HTTP upgrade handshake with error responses
//! - [`tls`] — PEM loading for `wss://`
//! - [`config`] — environment-driven configuration
//! - [`error`] — error types

pub mod broadcast;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod server;
pub mod state;
pub mod tls;
pub mod upgrade;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, Frame, HubStats};
pub use config::{RelayConfig, TlsConfig};
pub use error::{ConfigError, ProtocolError, ServerError};
pub use presence::{Peer, PeerId, PresenceRegistry};
pub use protocol::{
    CommandEvent, CursorEvent, Message, StateSnapshot, UserCount, UserDisconnected,
};
pub use relay::{Dispatch, Relay, RelayStats, Session, SessionState};
pub use server::RelayServer;
pub use state::{SharedState, StateStore};
