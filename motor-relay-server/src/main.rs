//! Motor relay server: shares motor state between the control UI and
//! actuator devices over WebSocket.
//!
//! Configured through environment variables (see `motor_relay::config`),
//! logs through `RUST_LOG` (default `info`).

use log::{error, info};
use motor_relay::{RelayConfig, RelayServer};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match RelayServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !server.is_tls() {
        info!("TLS disabled; set RELAY_TLS_CERT and RELAY_TLS_KEY to serve wss://");
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}
