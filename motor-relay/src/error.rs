//! Error types shared across the relay.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound payload is not valid UTF-8 JSON.
    #[error("Malformed payload: {0}")]
    Decode(#[source] serde_json::Error),
    /// Outbound message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Configuration errors, raised before the server binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("TLS needs both RELAY_TLS_CERT and RELAY_TLS_KEY")]
    IncompleteTls,
    #[error("Outbox capacity must be at least 1")]
    ZeroCapacity,
}

/// Server and transport errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("No certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("Upgrade rejected with {status}: {reason}")]
    UpgradeRejected { status: StatusCode, reason: String },
    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Socket write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
