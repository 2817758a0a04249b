//! Configuration for the relay server.
//!
//! Defaults work out of the box; override via environment variables:
//!
//! - `RELAY_BIND_ADDR`        (default: "0.0.0.0")
//! - `RELAY_PORT`             (default: "4777")
//! - `RELAY_TLS_CERT`         PEM certificate chain (enables `wss://`)
//! - `RELAY_TLS_KEY`          PEM private key (required with the cert)
//! - `RELAY_OUTBOX_CAPACITY`  (default: "256") frames queued per peer
//! - `RELAY_WRITE_TIMEOUT_MS` (default: "5000")
//! - `RELAY_HANDSHAKE_TIMEOUT_MS` (default: "10000") TLS + upgrade

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// PEM files for TLS termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,
    /// TCP port to listen on.
    pub port: u16,
    /// `None` serves plain `ws://`.
    pub tls: Option<TlsConfig>,
    /// Frames that may queue for one peer before it is evicted.
    pub outbox_capacity: usize,
    /// Longest a single socket write may take before the peer is dropped.
    pub write_timeout: Duration,
    /// Longest the TLS handshake and WebSocket upgrade may take together.
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 4777,
            tls: None,
            outbox_capacity: 256,
            write_timeout: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(10_000),
        }
    }
}

impl RelayConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr = lookup("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let port = parse_or_default(&lookup, "RELAY_PORT", defaults.port)?;
        let outbox_capacity =
            parse_or_default(&lookup, "RELAY_OUTBOX_CAPACITY", defaults.outbox_capacity)?;
        if outbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let write_timeout_ms = parse_or_default(
            &lookup,
            "RELAY_WRITE_TIMEOUT_MS",
            defaults.write_timeout.as_millis() as u64,
        )?;
        let handshake_timeout_ms = parse_or_default(
            &lookup,
            "RELAY_HANDSHAKE_TIMEOUT_MS",
            defaults.handshake_timeout.as_millis() as u64,
        )?;

        let tls = match (lookup("RELAY_TLS_CERT"), lookup("RELAY_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Self {
            bind_addr,
            port,
            tls,
            outbox_capacity,
            write_timeout: Duration::from_millis(write_timeout_ms),
            handshake_timeout: Duration::from_millis(handshake_timeout_ms),
        })
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// URL scheme peers should use.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "wss"
        } else {
            "ws"
        }
    }
}

fn parse_or_default<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
