//! Control-plane client (listener role).
//!
//! Connects with the device certificate presented and the monitor's
//! fingerprint pinned — the pin is enforced inside the TLS verifier, so no
//! application byte is ever written to an unverified server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tracing::{debug, warn};

use cribcall_core::types::epoch_ms;
use cribcall_core::CribcallError;
use cribcall_identity::tls::{client_config, server_name, PinnedServerVerifier};
use cribcall_identity::DeviceIdentity;

use crate::http::HttpConnection;
use crate::messages::ControlMessage;
use crate::ws;

pub const PING_INTERVAL: Duration = Duration::from_secs(20);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RESPONSE_BODY: usize = 64 * 1024;

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;

/// `GET /health` response.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub role: String,
    pub protocol: String,
    #[serde(rename = "mTLS")]
    pub m_tls: bool,
    pub trusted: bool,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
}

/// `POST /noise/subscribe` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscription_id: String,
    pub device_id: String,
    pub expires_at: String,
    pub accepted_lease_seconds: u64,
}

pub struct ControlClient {
    host: String,
    port: u16,
    expected_fingerprint: String,
    identity: Option<DeviceIdentity>,
}

impl ControlClient {
    /// `identity: None` connects without a client certificate (liveness
    /// checks only — every other endpoint will refuse).
    pub fn new(
        host: impl Into<String>,
        port: u16,
        expected_fingerprint: impl Into<String>,
        identity: Option<DeviceIdentity>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            expected_fingerprint: expected_fingerprint.into(),
            identity,
        }
    }

    async fn connect(&self) -> anyhow::Result<HttpConnection<TlsClientStream>> {
        let verifier = PinnedServerVerifier::pinned(&self.expected_fingerprint);
        let config = client_config(self.identity.as_ref(), Arc::clone(&verifier))?;
        let connector = tokio_rustls::TlsConnector::from(config);

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("TCP connect to {}:{}", self.host, self.port))?;
        tcp.set_nodelay(true)?;

        let name = server_name(&self.host)?;
        let tls = match connector.connect(name, tcp).await {
            Ok(tls) => tls,
            Err(e) => {
                // Surface a pin failure as its own error kind.
                if let Some(actual) = verifier.observed_fingerprint() {
                    if actual != self.expected_fingerprint {
                        return Err(CribcallError::FingerprintMismatch {
                            expected: self.expected_fingerprint.clone(),
                            actual,
                        }
                        .into());
                    }
                }
                return Err(anyhow::Error::from(e)
                    .context(format!("TLS handshake with {}:{}", self.host, self.port)));
            }
        };

        debug!("[control-client] Connected to {}:{}", self.host, self.port);
        Ok(HttpConnection::new(tls))
    }

    // ── HTTP operations ──────────────────────────────────────────────────────

    pub async fn health_check(&self) -> anyhow::Result<HealthReport> {
        let mut conn = self.connect().await?;
        conn.write_request("GET", "/health", &[], b"").await?;
        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        anyhow::ensure!(resp.status == 200, "health check returned {}", resp.status);
        Ok(resp.json()?)
    }

    /// Ask the monitor to remove us from its trust store. Returns whether a
    /// peer record was actually removed (idempotent).
    pub async fn request_unpair(&self, device_id: Option<&str>) -> anyhow::Result<bool> {
        let mut conn = self.connect().await?;
        let body = match device_id {
            Some(id) => serde_json::to_vec(&serde_json::json!({ "deviceId": id }))?,
            None => b"{}".to_vec(),
        };
        conn.write_request("POST", "/unpair", &[], &body).await?;
        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        anyhow::ensure!(resp.status == 200, "unpair returned {}", resp.status);
        let value: serde_json::Value = resp.json()?;
        Ok(value["unpaired"].as_bool().unwrap_or(false))
    }

    pub async fn subscribe_noise(
        &self,
        fcm_token: &str,
        platform: cribcall_core::PushPlatform,
        lease_seconds: Option<u64>,
    ) -> anyhow::Result<SubscribeAck> {
        let mut conn = self.connect().await?;
        let mut body = serde_json::json!({
            "fcmToken": fcm_token,
            "platform": platform,
        });
        if let Some(lease) = lease_seconds {
            body["leaseSeconds"] = lease.into();
        }
        conn.write_request("POST", "/noise/subscribe", &[], &serde_json::to_vec(&body)?)
            .await?;
        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        if resp.status != 200 {
            let err: serde_json::Value = resp.json().unwrap_or_default();
            anyhow::bail!(
                "subscribe returned {}: {}",
                resp.status,
                err["error"].as_str().unwrap_or("unknown")
            );
        }
        Ok(resp.json()?)
    }

    pub async fn unsubscribe_noise(
        &self,
        fcm_token: Option<&str>,
        subscription_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut conn = self.connect().await?;
        let mut body = serde_json::Map::new();
        if let Some(token) = fcm_token {
            body.insert("fcmToken".into(), token.into());
        }
        if let Some(id) = subscription_id {
            body.insert("subscriptionId".into(), id.into());
        }
        conn.write_request(
            "POST",
            "/noise/unsubscribe",
            &[],
            &serde_json::to_vec(&body)?,
        )
        .await?;
        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        anyhow::ensure!(resp.status == 200, "unsubscribe returned {}", resp.status);
        let value: serde_json::Value = resp.json()?;
        Ok(value["unsubscribed"].as_bool().unwrap_or(false))
    }

    // ── Control stream ───────────────────────────────────────────────────────

    /// Upgrade to the framed duplex channel. Application PING goes out every
    /// 20 s; the stream closes after 30 s without inbound traffic.
    pub async fn open_control_stream(&self) -> anyhow::Result<ControlStream> {
        let mut conn = self.connect().await?;

        let key = generate_key();
        conn.write_request(
            "GET",
            "/control/ws",
            &[
                ("Host", &format!("{}:{}", self.host, self.port)),
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Key", &key),
                ("Sec-WebSocket-Version", ws::WEBSOCKET_VERSION),
            ],
            b"",
        )
        .await?;

        let resp = conn.read_response(MAX_RESPONSE_BODY).await?;
        if resp.status != 101 {
            let err: serde_json::Value = resp.json().unwrap_or_default();
            anyhow::bail!(
                "control stream refused with {}: {}",
                resp.status,
                err["error"].as_str().unwrap_or("unknown")
            );
        }
        let expected_accept = ws::accept_key(&key);
        anyhow::ensure!(
            resp.header("sec-websocket-accept") == Some(expected_accept.as_str()),
            "Sec-WebSocket-Accept mismatch"
        );

        let (stream, leftover) = conn.into_inner();
        let ws = ws::client_stream(stream, leftover).await;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(32);
        let (in_tx, in_rx) = mpsc::channel::<ControlMessage>(32);

        // Writer: application messages + 20 s heartbeat.
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await; // immediate first tick
            loop {
                let frame = tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(msg) => match ws::encode_text(&msg) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("[control-client] Frame encode failed: {}", e);
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = ping.tick() => {
                        match ws::encode_text(&ControlMessage::Ping {
                            timestamp_ms: Some(epoch_ms()),
                        }) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        }
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: decode frames, answer app-level PING, forward the rest.
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
                    Err(_) => {
                        debug!("[control-client] Idle timeout");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!("[control-client] Read error: {}", e);
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                if frame.is_close() {
                    break;
                }
                let msgs = match ws::decode_frames::<ControlMessage>(&frame) {
                    Ok(msgs) => msgs,
                    Err(e) => {
                        warn!("[control-client] Bad frame: {}", e);
                        continue;
                    }
                };
                for msg in msgs {
                    match msg {
                        ControlMessage::Ping { timestamp_ms } => {
                            let _ = pong_tx.send(ControlMessage::Pong { timestamp_ms }).await;
                        }
                        other => {
                            if in_tx.send(other).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(ControlStream {
            outgoing: out_tx,
            incoming: in_rx,
            writer,
            reader,
        })
    }
}

/// Duplex framed channel returned by
/// [`open_control_stream`](ControlClient::open_control_stream).
pub struct ControlStream {
    pub outgoing: mpsc::Sender<ControlMessage>,
    pub incoming: mpsc::Receiver<ControlMessage>,
    writer: tokio::task::JoinHandle<()>,
    reader: tokio::task::JoinHandle<()>,
}

impl ControlStream {
    /// Tear the stream down immediately.
    pub fn close(self) {
        self.writer.abort();
        self.reader.abort();
    }
}
