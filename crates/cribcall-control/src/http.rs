//! Minimal HTTP/1.1 over an established stream.
//!
//! The control and pairing ports speak a deliberately small slice of
//! HTTP/1.1: request line + headers, Content-Length bodies, keep-alive, and
//! the WebSocket upgrade. Parsing happens here at the byte level so body caps
//! (413) and the upgrade handoff stay under direct control.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("connection closed mid-message")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    /// Header names lowercased at parse time.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// One HTTP/1.1 connection over `S`, usable from either side.
///
/// Owns a read buffer so bytes past the current message survive into the
/// next keep-alive round, and hands the raw stream back for the WebSocket
/// upgrade via [`into_inner`](Self::into_inner).
pub struct HttpConnection<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Hand back the raw stream plus any bytes read past the last message
    /// (they belong to whatever protocol follows, e.g. WebSocket frames).
    pub fn into_inner(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    // ── Server side ──────────────────────────────────────────────────────────

    /// Read the next request. `Ok(None)` on a clean close between requests.
    pub async fn read_request(&mut self, max_body: usize) -> Result<Option<Request>, HttpError> {
        let Some(head) = self.read_head().await? else {
            return Ok(None);
        };

        let text =
            String::from_utf8(head).map_err(|_| HttpError::Malformed("non-UTF-8 head".into()))?;

        let mut line_iter = text.split("\r\n");
        let first = line_iter
            .next()
            .ok_or_else(|| HttpError::Malformed("empty head".into()))?;
        let mut parts = first.split(' ');
        let method = parts
            .next()
            .ok_or_else(|| HttpError::Malformed("missing method".into()))?
            .to_owned();
        let target = parts
            .next()
            .ok_or_else(|| HttpError::Malformed("missing target".into()))?
            .to_owned();
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!("unsupported version {version}")));
        }

        let headers = parse_headers(line_iter)?;
        let body = self.read_body(&headers, max_body).await?;

        Ok(Some(Request {
            method,
            target,
            headers,
            body,
        }))
    }

    pub async fn write_response(
        &mut self,
        status: u16,
        extra_headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(), HttpError> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
        for (name, value) in extra_headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(
        &mut self,
        status: u16,
        value: &T,
    ) -> Result<(), HttpError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HttpError::Malformed(format!("response encode: {e}")))?;
        self.write_response(status, &[("Content-Type", "application/json")], &body)
            .await
    }

    /// Standard error body: `{"error": "<kind>", "message": "<human>"}`.
    pub async fn write_error(
        &mut self,
        status: u16,
        kind: &str,
        message: Option<&str>,
    ) -> Result<(), HttpError> {
        let mut body = serde_json::json!({ "error": kind });
        if let Some(message) = message {
            body["message"] = serde_json::Value::String(message.to_owned());
        }
        self.write_json(status, &body).await
    }

    /// Write a raw 101 Switching Protocols response (no Content-Length).
    pub async fn write_switching_protocols(
        &mut self,
        headers: &[(&str, &str)],
    ) -> Result<(), HttpError> {
        let mut head = String::from("HTTP/1.1 101 Switching Protocols\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    // ── Client side ──────────────────────────────────────────────────────────

    pub async fn write_request(
        &mut self,
        method: &str,
        target: &str,
        extra_headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(), HttpError> {
        let mut head = format!("{method} {target} HTTP/1.1\r\n");
        for (name, value) in extra_headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if !body.is_empty() || method == "POST" {
            head.push_str("Content-Type: application/json\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_response(&mut self, max_body: usize) -> Result<Response, HttpError> {
        let head = self.read_head().await?.ok_or(HttpError::Closed)?;
        let text = String::from_utf8(head).map_err(|_| HttpError::Malformed("non-UTF-8 head".into()))?;

        let mut line_iter = text.split("\r\n");
        let status_line = line_iter
            .next()
            .ok_or_else(|| HttpError::Malformed("empty head".into()))?;
        let mut parts = status_line.split(' ');
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!("unsupported version {version}")));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HttpError::Malformed("missing status code".into()))?;

        let headers = parse_headers(line_iter)?;
        let body = if status == 101 {
            Vec::new()
        } else {
            self.read_body(&headers, max_body).await?
        };

        Ok(Response {
            status,
            headers,
            body,
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Read bytes until the blank line; returns the head including the final
    /// CRLF pair's preceding content, leaving any surplus in the buffer.
    async fn read_head(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") {
                let head = self.buf[..pos].to_vec();
                self.buf.drain(..pos + 4);
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::Malformed("head too large".into()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HttpError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_body(
        &mut self,
        headers: &[(String, String)],
        max_body: usize,
    ) -> Result<Vec<u8>, HttpError> {
        let len: usize = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);
        if len > max_body {
            return Err(HttpError::PayloadTooLarge);
        }

        let mut body = Vec::with_capacity(len);
        let take = len.min(self.buf.len());
        body.extend_from_slice(&self.buf[..take]);
        self.buf.drain(..take);

        while body.len() < len {
            let mut chunk = vec![0u8; (len - body.len()).min(READ_CHUNK)];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(HttpError::Closed);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body)
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }
    Ok(headers)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_with_body() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_conn = HttpConnection::new(server);

        let writer = tokio::spawn(async move {
            let mut client_conn = HttpConnection::new(client);
            client_conn
                .write_request("POST", "/unpair", &[], br#"{"deviceId":"d1"}"#)
                .await
                .unwrap();
            client_conn
        });

        let req = server_conn.read_request(16 * 1024).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path(), "/unpair");
        assert_eq!(req.header("content-type"), Some("application/json"));
        let body: serde_json::Value = req.json().unwrap();
        assert_eq!(body["deviceId"], "d1");

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn keep_alive_reads_sequential_requests() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_conn = HttpConnection::new(server);
        let mut client_conn = HttpConnection::new(client);

        client_conn
            .write_request("GET", "/health", &[], b"")
            .await
            .unwrap();
        client_conn
            .write_request("GET", "/health", &[], b"")
            .await
            .unwrap();
        drop(client_conn);

        assert!(server_conn.read_request(1024).await.unwrap().is_some());
        assert!(server_conn.read_request(1024).await.unwrap().is_some());
        assert!(server_conn.read_request(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_body_is_rejected() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server_conn = HttpConnection::new(server);

        tokio::spawn(async move {
            let mut client_conn = HttpConnection::new(client);
            let body = vec![b'x'; 2048];
            let _ = client_conn.write_request("POST", "/pair", &[], &body).await;
            client_conn
        });

        let err = server_conn.read_request(1024).await.unwrap_err();
        assert!(matches!(err, HttpError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_conn = HttpConnection::new(server);
        let mut client_conn = HttpConnection::new(client);

        server_conn
            .write_json(200, &serde_json::json!({"status": "ok"}))
            .await
            .unwrap();

        let resp = client_conn.read_response(16 * 1024).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("application/json"));
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn error_body_carries_kind_and_message() {
        let (client, server) = tokio::io::duplex(4096);
        let mut server_conn = HttpConnection::new(server);
        let mut client_conn = HttpConnection::new(client);

        server_conn
            .write_error(403, "certificate_not_trusted", Some("unknown peer"))
            .await
            .unwrap();

        let resp = client_conn.read_response(16 * 1024).await.unwrap();
        assert_eq!(resp.status, 403);
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["error"], "certificate_not_trusted");
        assert_eq!(body["message"], "unknown peer");
    }
}
