//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► [TLS handshake] ──► HTTP upgrade
//!                     (both bounded by handshake_timeout)
//!                                                     │
//!                                         ┌───────────┴───────────┐
//!                                         ▼                       ▼
//!                                  inbound frames           outbox frames
//!                                  Session::handle_message  socket write
//!                                         │                 (bounded by
//!                                         ▼                  write_timeout)
//!                                   Relay (shared)
//! ```
//!
//! One task per connection. It selects between eviction, frames from the
//! socket and frames from its outbox, writing the latter in queue order.
//! When any of them ends the connection (eviction, peer close, socket
//! error, write timeout) the session is closed so the other peers hear
//! about it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Frame;
use crate::config::RelayConfig;
use crate::error::ServerError;
use crate::relay::{Relay, Session};
use crate::tls;
use crate::upgrade;

/// Per-connection time limits.
#[derive(Debug, Clone, Copy)]
struct Timeouts {
    handshake: Duration,
    write: Duration,
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    tls: Option<TlsAcceptor>,
    scheme: &'static str,
    timeouts: Timeouts,
}

impl RelayServer {
    /// Load TLS material (if configured) and bind the listener.
    pub async fn bind(config: RelayConfig) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(tls::load_acceptor).transpose()?;
        let listener = TcpListener::bind(config.socket_addr_string()).await?;

        Ok(Self {
            listener,
            relay: Arc::new(Relay::new(config.outbox_capacity)),
            tls,
            scheme: config.scheme(),
            timeouts: Timeouts {
                handshake: config.handshake_timeout,
                write: config.write_timeout,
            },
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// `ws` or `wss`.
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        log::info!(
            "Motor relay listening on {}://{}",
            self.scheme,
            self.local_addr()?
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let tls = self.tls.clone();
            let timeouts = self.timeouts;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, relay, tls, timeouts).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay>,
    tls: Option<TlsAcceptor>,
    timeouts: Timeouts,
) -> Result<(), ServerError> {
    let Some(acceptor) = tls else {
        return serve_connection(stream, addr, relay, timeouts).await;
    };

    let started = tokio::time::Instant::now();
    let stream = match tokio::time::timeout(timeouts.handshake, acceptor.accept(stream)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(ServerError::HandshakeTimeout(timeouts.handshake)),
    };
    // The upgrade gets whatever is left of the handshake budget.
    let remaining = Timeouts {
        handshake: timeouts.handshake.saturating_sub(started.elapsed()),
        ..timeouts
    };
    serve_connection(stream, addr, relay, remaining).await
}

/// Upgrade, open a session, pump frames, and always close the session.
async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    relay: Arc<Relay>,
    timeouts: Timeouts,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // A failed upgrade never reaches `open`.
    let ws_stream = match tokio::time::timeout(timeouts.handshake, upgrade::accept(stream)).await {
        Ok(ws_stream) => ws_stream?,
        Err(_) => return Err(ServerError::HandshakeTimeout(timeouts.handshake)),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut session = relay.session(addr.ip().to_string());
    let Some(mut outbox) = session.open().await else {
        return Ok(());
    };

    let result = pump(
        &session,
        &mut ws_sender,
        &mut ws_receiver,
        &mut outbox,
        timeouts.write,
    )
    .await;
    session.close().await;
    result
}

async fn pump<S>(
    session: &Session,
    ws_sender: &mut SplitSink<WebSocketStream<S>, Message>,
    ws_receiver: &mut SplitStream<WebSocketStream<S>>,
    outbox: &mut mpsc::Receiver<Frame>,
    write_timeout: Duration,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            // Checked first so an evicted peer's backlog is not written out.
            biased;

            () = session.evicted() => {
                log::warn!("Peer {} was evicted, closing connection", session.id());
                return Ok(());
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(session, text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => dispatch(session, &data).await,
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Peer {} closed the connection", session.id());
                        return Ok(());
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    log::debug!("Outbox for peer {} closed", session.id());
                    return Ok(());
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(frame))).await {
                    Ok(sent) => sent?,
                    Err(_) => {
                        log::warn!("Write to peer {} timed out after {write_timeout:?}", session.id());
                        return Err(ServerError::WriteTimeout(write_timeout));
                    }
                }
            }
        }
    }
}

async fn dispatch(session: &Session, raw: &[u8]) {
    if let Err(e) = session.handle_message(raw).await {
        log::warn!("Dropping message from peer {}: {e}", session.id());
    }
}
