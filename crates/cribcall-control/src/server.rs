//! The mTLS control server.
//!
//! TLS handshakes succeed for clients whose leaf fingerprint is in the
//! acceptance set (trusted peers, plus any explicitly seeded test-only
//! certificates); a bare client (no certificate) also handshakes so that
//! `/health` stays reachable. Each connection is then classified once:
//! `trusted` iff its fingerprint matches a TrustedPeer at accept time.
//!
//! HTTP requests are served keep-alive with a 30 s idle timeout and a 16 KiB
//! body cap. `/control/ws` upgrades to the framed message channel; outbound
//! traffic per connection goes through a bounded queue so a slow listener
//! never blocks the detector or its siblings.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use cribcall_core::types::{epoch_ms, sha256_hex, DetectedNoise, DeviceRole};
use cribcall_core::CribcallError;
use cribcall_identity::tls::{mtls_server_config, TlsAcceptance};
use cribcall_identity::{DeviceIdentity, TrustStore};

use crate::http::{HttpConnection, HttpError, Request};
use crate::messages::ControlMessage;
use crate::queue::{OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use crate::subscriptions::NoiseSubscriptionRegistry;
use crate::ws;

pub const MAX_CONTROL_BODY: usize = 16 * 1024;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type TlsServerStream = tokio_rustls::server::TlsStream<tokio::net::TcpStream>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ── Context & events ──────────────────────────────────────────────────────────

/// Everything the server needs from the embedding process.
pub struct ControlServerContext {
    pub role: DeviceRole,
    pub identity: DeviceIdentity,
    pub trust_store: Arc<TrustStore>,
    pub registry: Arc<NoiseSubscriptionRegistry>,
    pub acceptance: Arc<TlsAcceptance>,
}

/// Events surfaced to the embedding app.
#[derive(Debug)]
pub enum ControlServerEvent {
    PeerConnected {
        connection_id: u64,
        device_id: String,
        fingerprint: String,
    },
    PeerDisconnected {
        connection_id: u64,
        device_id: String,
        fingerprint: String,
        /// Stream sessions owned by the connection, terminated by the drop.
        terminated_sessions: Vec<String>,
    },
    /// A stream/WebRTC message from a peer, to be handled or relayed.
    StreamMessage {
        connection_id: u64,
        device_id: String,
        fingerprint: String,
        message: ControlMessage,
    },
}

struct ConnectionEntry {
    device_id: String,
    fingerprint: String,
    connected_at_ms: u64,
    queue: Arc<OutboundQueue>,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Shared view of the running server: live connections and send paths.
pub struct ControlServerHandle {
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
    trust_store: Arc<TrustStore>,
    started_at: Instant,
    local_addr: SocketAddr,
}

impl ControlServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connection map lock poisoned")
            .len()
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.connections
            .read()
            .expect("connection map lock poisoned")
            .values()
            .any(|c| c.device_id == device_id)
    }

    pub fn online_devices(&self) -> HashSet<String> {
        self.connections
            .read()
            .expect("connection map lock poisoned")
            .values()
            .map(|c| c.device_id.clone())
            .collect()
    }

    /// Enqueue a NOISE_EVENT to every connection whose fingerprint is
    /// currently trusted. Never blocks; returns how many were enqueued.
    pub fn broadcast_noise(&self, event: DetectedNoise) -> usize {
        let connections = self
            .connections
            .read()
            .expect("connection map lock poisoned");
        let mut sent = 0;
        for entry in connections.values() {
            if self.trust_store.contains_fingerprint(&entry.fingerprint) {
                entry.queue.push(ControlMessage::noise(event));
                sent += 1;
            }
        }
        sent
    }

    /// Enqueue a message to every live connection of `device_id`.
    pub fn send_to_device(&self, device_id: &str, message: ControlMessage) -> bool {
        let connections = self
            .connections
            .read()
            .expect("connection map lock poisoned");
        let mut sent = false;
        for entry in connections.values() {
            if entry.device_id == device_id {
                entry.queue.push(message.clone());
                sent = true;
            }
        }
        sent
    }

    pub fn send_to_connection(&self, connection_id: u64, message: ControlMessage) -> bool {
        let connections = self
            .connections
            .read()
            .expect("connection map lock poisoned");
        match connections.get(&connection_id) {
            Some(entry) => {
                entry.queue.push(message);
                true
            }
            None => false,
        }
    }

    /// Total NOISE_EVENTs evicted by queue overflow, across connections.
    pub fn dropped_noise_events(&self) -> u64 {
        self.connections
            .read()
            .expect("connection map lock poisoned")
            .values()
            .map(|c| c.queue.dropped())
            .sum()
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct ControlServer;

impl ControlServer {
    /// Start serving on an already-bound listener (callers pick the port;
    /// tests bind port 0).
    pub async fn start(
        ctx: ControlServerContext,
        listener: TcpListener,
    ) -> anyhow::Result<(
        Arc<ControlServerHandle>,
        mpsc::Receiver<ControlServerEvent>,
        tokio::task::JoinHandle<()>,
    )> {
        let config = mtls_server_config(&ctx.identity, Arc::clone(&ctx.acceptance))?;
        let acceptor = TlsAcceptor::from(config);
        let local_addr = listener.local_addr()?;

        let handle = Arc::new(ControlServerHandle {
            connections: RwLock::new(HashMap::new()),
            trust_store: Arc::clone(&ctx.trust_store),
            started_at: Instant::now(),
            local_addr,
        });
        let (event_tx, event_rx) = mpsc::channel(64);

        let ctx = Arc::new(ctx);
        let loop_handle = Arc::clone(&handle);
        let join = tokio::spawn(async move {
            run_accept_loop(listener, acceptor, ctx, loop_handle, event_tx).await;
        });

        info!("[control] mTLS control server listening on {}", local_addr);
        Ok((handle, event_rx, join))
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<ControlServerContext>,
    handle: Arc<ControlServerHandle>,
    event_tx: mpsc::Sender<ControlServerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let acceptor = acceptor.clone();
                let ctx = Arc::clone(&ctx);
                let handle = Arc::clone(&handle);
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => handle_connection(tls, addr, ctx, handle, event_tx).await,
                        Err(e) => warn!("[control] TLS handshake failed from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => warn!("[control] TCP accept error: {}", e),
        }
    }
}

// ── Per-connection handling ───────────────────────────────────────────────────

async fn handle_connection(
    tls: TlsServerStream,
    addr: SocketAddr,
    ctx: Arc<ControlServerContext>,
    handle: Arc<ControlServerHandle>,
    event_tx: mpsc::Sender<ControlServerEvent>,
) {
    // Classify once, at accept time.
    let fingerprint = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| sha256_hex(cert.as_ref()));
    let peer = fingerprint
        .as_deref()
        .and_then(|fp| ctx.trust_store.lookup_by_fingerprint(fp));
    let trusted = peer.is_some();
    let device_id = peer.map(|p| p.remote_device_id);

    debug!(
        "[control] Connection from {} (cert: {}, trusted: {})",
        addr,
        fingerprint.as_deref().map(|f| &f[..16]).unwrap_or("none"),
        trusted
    );

    let mut conn = HttpConnection::new(tls);
    loop {
        let req = match tokio::time::timeout(IDLE_TIMEOUT, conn.read_request(MAX_CONTROL_BODY)).await
        {
            Err(_) => {
                debug!("[control] {} idle timeout", addr);
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Ok(Some(req))) => req,
            Ok(Err(HttpError::PayloadTooLarge)) => {
                let _ = conn.write_error(413, "payload_too_large", None).await;
                return;
            }
            Ok(Err(e)) => {
                debug!("[control] {} request error: {}", addr, e);
                return;
            }
        };

        let outcome = match (req.method.as_str(), req.path()) {
            ("GET", "/health") => handle_health(&mut conn, &ctx, &handle, &fingerprint, trusted).await,
            ("POST", "/unpair") => {
                handle_unpair(&mut conn, &req, &ctx, fingerprint.as_deref(), trusted).await
            }
            ("POST", "/noise/subscribe") => {
                handle_subscribe(&mut conn, &req, &ctx, fingerprint.as_deref(), trusted).await
            }
            ("POST", "/noise/unsubscribe") => {
                handle_unsubscribe(&mut conn, &req, &ctx, fingerprint.as_deref(), trusted).await
            }
            ("GET", "/control/ws") => {
                let Some(fp) = fingerprint.clone() else {
                    let _ = conn.write_error(401, "client_certificate_required", None).await;
                    continue;
                };
                if !trusted {
                    let _ = conn.write_error(403, "certificate_not_trusted", None).await;
                    continue;
                }
                match ws::validate_upgrade(&req) {
                    Err(reason) => {
                        let _ = conn.write_error(426, "upgrade_required", Some(reason)).await;
                        continue;
                    }
                    Ok(client_key) => {
                        let device_id = device_id.clone().unwrap_or_default();
                        serve_ws(conn, client_key, fp, device_id, handle, event_tx).await;
                        return;
                    }
                }
            }
            _ => conn.write_error(404, "not_found", None).await,
        };

        if outcome.is_err() {
            return;
        }
    }
}

async fn handle_health(
    conn: &mut HttpConnection<TlsServerStream>,
    ctx: &ControlServerContext,
    handle: &ControlServerHandle,
    fingerprint: &Option<String>,
    trusted: bool,
) -> Result<(), HttpError> {
    conn.write_json(
        200,
        &serde_json::json!({
            "status": "ok",
            "role": ctx.role.to_string(),
            "protocol": "http-ws",
            "mTLS": fingerprint.is_some(),
            "trusted": trusted,
            "uptimeSeconds": handle.uptime_seconds(),
        }),
    )
    .await
}

async fn handle_unpair(
    conn: &mut HttpConnection<TlsServerStream>,
    req: &Request,
    ctx: &ControlServerContext,
    fingerprint: Option<&str>,
    trusted: bool,
) -> Result<(), HttpError> {
    let Some(fp) = fingerprint else {
        return conn.write_error(401, "client_certificate_required", None).await;
    };
    if !trusted {
        return conn.write_error(403, "certificate_not_trusted", None).await;
    }

    let requested_id = req
        .json::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("deviceId").and_then(|d| d.as_str()).map(str::to_owned));

    // A peer can only ever remove itself: removal is keyed by the
    // connection's own fingerprint.
    match ctx.trust_store.remove_by_fingerprint(fp).await {
        Ok(Some(peer)) => {
            info!("[control] Peer {} unpaired itself", peer.remote_device_id);
            conn.write_json(
                200,
                &serde_json::json!({
                    "status": "ok",
                    "unpaired": true,
                    "deviceId": requested_id.unwrap_or(peer.remote_device_id),
                }),
            )
            .await
        }
        Ok(None) => {
            conn.write_json(
                200,
                &serde_json::json!({
                    "status": "ok",
                    "unpaired": false,
                    "reason": "device_not_found",
                }),
            )
            .await
        }
        Err(e) => {
            warn!("[control] Unpair failed: {}", e);
            conn.write_error(500, "internal", None).await
        }
    }
}

fn validate_subscribe_body(
    body: &serde_json::Value,
) -> Result<(String, cribcall_core::PushPlatform, Option<u64>), CribcallError> {
    const KNOWN_FIELDS: [&str; 7] = [
        "fcmToken",
        "platform",
        "leaseSeconds",
        "threshold",
        "cooldownSeconds",
        "autoStreamType",
        "autoStreamDurationSec",
    ];

    let obj = body.as_object().ok_or(CribcallError::InvalidFcmToken)?;
    if obj.contains_key("deviceId") {
        return Err(CribcallError::DeviceIdForbidden);
    }
    let unknown: Vec<String> = obj
        .keys()
        .filter(|k| !KNOWN_FIELDS.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(CribcallError::UnknownFields(unknown));
    }

    let fcm_token = obj
        .get("fcmToken")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(CribcallError::InvalidFcmToken)?
        .to_owned();
    let platform = obj
        .get("platform")
        .and_then(|v| v.as_str())
        .and_then(cribcall_core::PushPlatform::parse)
        .ok_or(CribcallError::InvalidPlatform)?;
    let lease = obj.get("leaseSeconds").and_then(|v| v.as_u64());

    Ok((fcm_token, platform, lease))
}

async fn handle_subscribe(
    conn: &mut HttpConnection<TlsServerStream>,
    req: &Request,
    ctx: &ControlServerContext,
    fingerprint: Option<&str>,
    trusted: bool,
) -> Result<(), HttpError> {
    let Some(fp) = fingerprint else {
        return conn.write_error(401, "client_certificate_required", None).await;
    };
    let Some(peer) = ctx.trust_store.lookup_by_fingerprint(fp).filter(|_| trusted) else {
        return conn.write_error(403, "certificate_not_trusted", None).await;
    };

    let body: serde_json::Value = match req.json() {
        Ok(v) => v,
        Err(_) => return conn.write_error(400, "invalid_fcm_token", Some("JSON body required")).await,
    };

    let (fcm_token, platform, lease) = match validate_subscribe_body(&body) {
        Ok(parts) => parts,
        Err(CribcallError::UnknownFields(fields)) => {
            return conn
                .write_json(400, &serde_json::json!({"error": "unknown_fields", "fields": fields}))
                .await;
        }
        Err(e) => return conn.write_error(400, e.kind(), Some(&e.to_string())).await,
    };

    match ctx
        .registry
        .subscribe(&peer.remote_device_id, fp, &fcm_token, platform, lease)
        .await
    {
        Ok((sub, accepted_lease)) => {
            let expires_at = chrono::DateTime::<chrono::Utc>::from_timestamp(
                sub.expires_at_epoch_sec as i64,
                0,
            )
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_default();
            conn.write_json(
                200,
                &serde_json::json!({
                    "subscriptionId": sub.subscription_id,
                    "deviceId": sub.device_id,
                    "expiresAt": expires_at,
                    "acceptedLeaseSeconds": accepted_lease,
                }),
            )
            .await
        }
        Err(e) => {
            warn!("[control] Subscribe failed: {}", e);
            conn.write_error(500, "internal", None).await
        }
    }
}

async fn handle_unsubscribe(
    conn: &mut HttpConnection<TlsServerStream>,
    req: &Request,
    ctx: &ControlServerContext,
    fingerprint: Option<&str>,
    trusted: bool,
) -> Result<(), HttpError> {
    let Some(fp) = fingerprint else {
        return conn.write_error(401, "client_certificate_required", None).await;
    };
    let Some(peer) = ctx.trust_store.lookup_by_fingerprint(fp).filter(|_| trusted) else {
        return conn.write_error(403, "certificate_not_trusted", None).await;
    };

    let body: serde_json::Value = req.json().unwrap_or(serde_json::Value::Null);
    let fcm_token = body.get("fcmToken").and_then(|v| v.as_str());
    let subscription_id = body.get("subscriptionId").and_then(|v| v.as_str());
    if fcm_token.is_none() && subscription_id.is_none() {
        return conn.write_error(400, "missing_identifier", None).await;
    }

    match ctx
        .registry
        .unsubscribe(&peer.remote_device_id, fcm_token, subscription_id)
        .await
    {
        Ok(unsubscribed) => {
            conn.write_json(
                200,
                &serde_json::json!({
                    "deviceId": peer.remote_device_id,
                    "unsubscribed": unsubscribed,
                }),
            )
            .await
        }
        Err(e) => {
            warn!("[control] Unsubscribe failed: {}", e);
            conn.write_error(500, "internal", None).await
        }
    }
}

// ── WebSocket channel ─────────────────────────────────────────────────────────

async fn serve_ws(
    conn: HttpConnection<TlsServerStream>,
    client_key: String,
    fingerprint: String,
    device_id: String,
    handle: Arc<ControlServerHandle>,
    event_tx: mpsc::Sender<ControlServerEvent>,
) {
    let ws = match ws::complete_upgrade(conn, &client_key).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[control] WebSocket upgrade failed for {}: {}", device_id, e);
            return;
        }
    };

    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::new(OutboundQueue::new(DEFAULT_QUEUE_CAPACITY));
    handle
        .connections
        .write()
        .expect("connection map lock poisoned")
        .insert(
            connection_id,
            ConnectionEntry {
                device_id: device_id.clone(),
                fingerprint: fingerprint.clone(),
                connected_at_ms: epoch_ms(),
                queue: Arc::clone(&queue),
            },
        );
    let _ = event_tx
        .send(ControlServerEvent::PeerConnected {
            connection_id,
            device_id: device_id.clone(),
            fingerprint: fingerprint.clone(),
        })
        .await;
    info!("[control] {} opened control stream (conn {})", device_id, connection_id);

    let (mut sink, mut stream) = ws.split();

    // Writer: drain the bounded queue in enqueue order. A failed send drops
    // only this connection.
    let writer_queue = Arc::clone(&queue);
    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_queue.pop().await {
            let frame = match ws::encode_text(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[control] Frame encode failed: {}", e);
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: WS-level PINGs are answered by the protocol layer; app-level
    // PING gets an app-level PONG; everything else is surfaced to the app.
    let mut sessions: HashSet<String> = HashSet::new();
    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                debug!("[control] Conn {} idle timeout", connection_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("[control] Conn {} read error: {}", connection_id, e);
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
                warn!("[control] Conn {} bad frame: {}", connection_id, e);
                continue;
            }
        };
        for msg in msgs {
            match msg {
                ControlMessage::Ping { timestamp_ms } => {
                    queue.push(ControlMessage::Pong { timestamp_ms });
                }
                ControlMessage::Pong { .. } => {}
                other => {
                    if let Some(session_id) = other.session_id().map(str::to_owned) {
                        if matches!(other, ControlMessage::EndStream { .. }) {
                            sessions.remove(&session_id);
                        } else {
                            sessions.insert(session_id);
                        }
                    }
                    let _ = event_tx
                        .send(ControlServerEvent::StreamMessage {
                            connection_id,
                            device_id: device_id.clone(),
                            fingerprint: fingerprint.clone(),
                            message: other,
                        })
                        .await;
                }
            }
        }
    }

    queue.close();
    handle
        .connections
        .write()
        .expect("connection map lock poisoned")
        .remove(&connection_id);
    let _ = writer.await;
    let _ = event_tx
        .send(ControlServerEvent::PeerDisconnected {
            connection_id,
            device_id: device_id.clone(),
            fingerprint,
            terminated_sessions: sessions.into_iter().collect(),
        })
        .await;
    info!("[control] {} closed control stream (conn {})", device_id, connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_body_rejects_device_id_first() {
        // deviceId is checked before anything else, even alongside an
        // otherwise-valid body.
        let err = validate_subscribe_body(&json!({
            "fcmToken": "t", "platform": "android", "deviceId": "spoof"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "device_id_forbidden");
    }

    #[test]
    fn subscribe_body_rejects_unknown_fields() {
        let err = validate_subscribe_body(&json!({
            "fcmToken": "t", "platform": "android", "color": "red", "shape": "round"
        }))
        .unwrap_err();
        match err {
            CribcallError::UnknownFields(fields) => {
                assert!(fields.contains(&"color".to_owned()));
                assert!(fields.contains(&"shape".to_owned()));
            }
            other => panic!("expected unknown_fields, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_body_requires_token_and_platform() {
        let err = validate_subscribe_body(&json!({"platform": "android"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_fcm_token");

        let err = validate_subscribe_body(&json!({"fcmToken": "t"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_platform");

        let err =
            validate_subscribe_body(&json!({"fcmToken": "t", "platform": "windows"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_platform");

        let err = validate_subscribe_body(&json!({"fcmToken": "", "platform": "ios"})).unwrap_err();
        assert_eq!(err.kind(), "invalid_fcm_token");
    }

    #[test]
    fn subscribe_body_accepts_optional_fields() {
        let (token, platform, lease) = validate_subscribe_body(&json!({
            "fcmToken": "token123",
            "platform": "android",
            "leaseSeconds": 7200,
            "threshold": 40,
            "cooldownSeconds": 5,
            "autoStreamType": "audio",
            "autoStreamDurationSec": 60
        }))
        .unwrap();
        assert_eq!(token, "token123");
        assert_eq!(platform, cribcall_core::PushPlatform::Android);
        assert_eq!(lease, Some(7200));
    }
}
