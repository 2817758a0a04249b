//! HTTP → WebSocket upgrade.
//!
//! The request head is parsed with `httparse` and checked against the
//! RFC 6455 rules by tungstenite. A request that cannot be upgraded is
//! answered with an HTTP error status before the socket is closed.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::{create_response, write_response, Request};
use tokio_tungstenite::tungstenite::http::{self, StatusCode, Version};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::error::ServerError;

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Body sent with every rejected upgrade.
pub const REJECTION_BODY: &str = "Upgrade failed";

/// Read the upgrade request, answer it, and hand back the WebSocket.
///
/// A request that is not a valid upgrade gets an error response and
/// `ServerError::UpgradeRejected`.
pub async fn accept<S>(mut stream: S) -> Result<WebSocketStream<S>, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, rest) = match read_head(&mut stream).await {
        Ok(head) => head,
        Err(ServerError::UpgradeRejected { status, reason }) => {
            return reject(&mut stream, status, reason).await;
        }
        Err(e) => return Err(e),
    };

    let response = match create_response(&request) {
        Ok(response) => response,
        Err(e) => return reject(&mut stream, StatusCode::BAD_REQUEST, e.to_string()).await,
    };

    let mut head = Vec::with_capacity(256);
    write_response(&mut head, &response)?;
    stream.write_all(&head).await?;
    stream.flush().await?;

    // Bytes after the request head already belong to the WebSocket.
    Ok(WebSocketStream::from_partially_read(stream, rest, Role::Server, None).await)
}

/// Returns the parsed request and any bytes read past its head.
async fn read_head<S>(stream: &mut S) -> Result<(Request, Vec<u8>), ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the upgrade request completed",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let request = to_request(&parsed)?;
                let rest = buf.split_off(len);
                return Ok((request, rest));
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD_BYTES => {}
            Ok(httparse::Status::Partial) => {
                return Err(rejected(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "request head too large",
                ));
            }
            Err(e) => return Err(rejected(StatusCode::BAD_REQUEST, e.to_string())),
        }
    }
}

fn to_request(parsed: &httparse::Request<'_, '_>) -> Result<Request, ServerError> {
    let method = parsed.method.unwrap_or_default();
    if method != "GET" {
        return Err(rejected(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{method} cannot be upgraded"),
        ));
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = http::Request::builder()
        .method(method)
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder
        .body(())
        .map_err(|e| rejected(StatusCode::BAD_REQUEST, e.to_string()))
}

fn rejected(status: StatusCode, reason: impl Into<String>) -> ServerError {
    ServerError::UpgradeRejected {
        status,
        reason: reason.into(),
    }
}

async fn reject<S, T>(stream: &mut S, status: StatusCode, reason: String) -> Result<T, ServerError>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{REJECTION_BODY}",
        REJECTION_BODY.len()
    );
    stream.write_all(response.as_bytes()).await?;
    // The peer may already be gone; the rejection is reported either way.
    let _ = stream.shutdown().await;
    Err(ServerError::UpgradeRejected { status, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::Message;

    async fn respond_to(request: &str) -> (Result<(), ServerError>, String) {
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(async move { accept(server).await.map(|_| ()) });

        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (
            handle.await.unwrap(),
            String::from_utf8(response).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_plain_get_is_rejected_with_400() {
        let (result, response) = respond_to("GET / HTTP/1.1\r\nHost: relay\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        assert!(response.ends_with(REJECTION_BODY));
        assert!(matches!(
            result,
            Err(ServerError::UpgradeRejected {
                status: StatusCode::BAD_REQUEST,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_post_is_rejected_with_405() {
        let (result, response) =
            respond_to("POST / HTTP/1.1\r\nHost: relay\r\nContent-Length: 0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{response}");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let (result, response) = respond_to("\x01\x02 nonsense\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 "), "{response}");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_valid_upgrade_yields_websocket() {
        let (client, server) = duplex(4096);
        let handle = tokio::spawn(async move {
            let mut ws = accept(server).await.unwrap();
            ws.send(Message::text("hello")).await.unwrap();
            ws
        });

        let (mut ws, response) = tokio_tungstenite::client_async("ws://localhost/", client)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let _server_ws = handle.await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("hello"));
    }

    #[tokio::test]
    async fn test_eof_before_head_is_an_io_error() {
        let (client, server) = duplex(64);
        drop(client);
        assert!(matches!(accept(server).await, Err(ServerError::Io(_))));
    }
}
