//! RFC 6455 upgrade handling and frame codec for the control channel.
//!
//! The HTTP layer owns the upgrade request; this module validates it,
//! computes the accept key, writes the 101, and hands the raw stream to
//! tungstenite for frame handling. Application payloads are either one text
//! JSON message per frame or a binary batch of u32-BE length-prefixed JSON
//! messages; both decode through [`decode_frames`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::http::{HttpConnection, HttpError, Request};

pub const WEBSOCKET_VERSION: &str = "13";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("truncated length-prefixed batch")]
    Truncated,
}

/// `Sec-WebSocket-Accept` for a client key (RFC 6455 §4.2.2).
pub fn accept_key(client_key: &str) -> String {
    derive_accept_key(client_key.as_bytes())
}

/// Validate the upgrade headers of `req`; returns the client key, or the
/// failing requirement for a 426 response.
pub fn validate_upgrade(req: &Request) -> Result<String, &'static str> {
    if !req
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err("Upgrade: websocket header required");
    }
    if !req
        .header("connection")
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
    {
        return Err("Connection: Upgrade header required");
    }
    if req.header("sec-websocket-version") != Some(WEBSOCKET_VERSION) {
        return Err("Sec-WebSocket-Version: 13 required");
    }
    req.header("sec-websocket-key")
        .map(str::to_owned)
        .ok_or("Sec-WebSocket-Key header required")
}

/// Write the 101 response and wrap the stream as a server-side WebSocket.
/// Bytes the HTTP layer read past the request head are fed back in so no
/// early frame is lost.
pub async fn complete_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    mut conn: HttpConnection<S>,
    client_key: &str,
) -> Result<WebSocketStream<S>, HttpError> {
    let accept = accept_key(client_key);
    conn.write_switching_protocols(&[
        ("Upgrade", "websocket"),
        ("Connection", "Upgrade"),
        ("Sec-WebSocket-Accept", &accept),
    ])
    .await?;

    let (stream, leftover) = conn.into_inner();
    Ok(WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await)
}

/// Wrap an already-upgraded client-side stream, replaying bytes the HTTP
/// layer read past the 101 response.
pub async fn client_stream<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    leftover: Vec<u8>,
) -> WebSocketStream<S> {
    WebSocketStream::from_partially_read(stream, leftover, Role::Client, None).await
}

// ── Frame codec ───────────────────────────────────────────────────────────────

/// Decode every application message carried by one WebSocket frame.
///
/// Text frames carry a single JSON message. Binary frames carry one or more
/// `u32 BE length | JSON` records back to back (batching). Control frames
/// decode to nothing.
pub fn decode_frames<T: DeserializeOwned>(msg: &Message) -> Result<Vec<T>, FrameError> {
    match msg {
        Message::Text(text) => Ok(vec![serde_json::from_str(text)?]),
        Message::Binary(buf) => {
            let mut out = Vec::new();
            let mut rest: &[u8] = buf;
            while !rest.is_empty() {
                if rest.len() < 4 {
                    return Err(FrameError::Truncated);
                }
                let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                rest = &rest[4..];
                if rest.len() < len {
                    return Err(FrameError::Truncated);
                }
                out.push(serde_json::from_slice(&rest[..len])?);
                rest = &rest[len..];
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}

/// One message as a text frame.
pub fn encode_text<T: Serialize>(msg: &T) -> Result<Message, FrameError> {
    Ok(Message::Text(serde_json::to_string(msg)?))
}

/// A batch of messages as one length-prefixed binary frame.
pub fn encode_binary_batch<T: Serialize>(msgs: &[T]) -> Result<Message, FrameError> {
    let mut buf = Vec::new();
    for msg in msgs {
        let json = serde_json::to_vec(msg)?;
        buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&json);
    }
    Ok(Message::Binary(buf))
}
