//! TLS pairing server (monitor side).
//!
//! Listens on the pairing port with the monitor certificate presented and no
//! client-certificate requirement — a listener arriving here is by definition
//! not yet trusted. Its certificate is still requested and observed so the
//! leaf can be pinned once the user confirms. Two transports carry the same
//! message set: `POST /pair` with one framed message per request, and a
//! WebSocket upgrade on the same path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use cribcall_control::http::{HttpConnection, HttpError};
use cribcall_control::ws;
use cribcall_core::types::TrustedPeer;
use cribcall_identity::tls::pairing_server_config;
use cribcall_identity::{DeviceIdentity, TrustStore};

use crate::messages::{PairingMessage, RejectReason};
use crate::session::PairingEngine;

pub const MAX_PAIRING_BODY: usize = 64 * 1024;

/// Generous read timeout: a session may sit idle while the human reads the
/// PIN off the monitor before the listener submits.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

type TlsServerStream = tokio_rustls::server::TlsStream<tokio::net::TcpStream>;

pub struct PairingServer;

impl PairingServer {
    pub async fn start(
        engine: Arc<PairingEngine>,
        identity: &DeviceIdentity,
        trust_store: Arc<TrustStore>,
        listener: TcpListener,
    ) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let config = pairing_server_config(identity)?;
        let acceptor = TlsAcceptor::from(config);
        let addr = listener.local_addr()?;

        let join = tokio::spawn(async move {
            run_accept_loop(listener, acceptor, engine, trust_store).await;
        });
        info!("[pairing] TLS pairing server listening on {}", addr);
        Ok((addr, join))
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    engine: Arc<PairingEngine>,
    trust_store: Arc<TrustStore>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let acceptor = acceptor.clone();
                let engine = Arc::clone(&engine);
                let trust_store = Arc::clone(&trust_store);
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => handle_connection(tls, addr, engine, trust_store).await,
                        Err(e) => warn!("[pairing] TLS handshake failed from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => warn!("[pairing] TCP accept error: {}", e),
        }
    }
}

async fn handle_connection(
    tls: TlsServerStream,
    addr: SocketAddr,
    engine: Arc<PairingEngine>,
    trust_store: Arc<TrustStore>,
) {
    // Leaf the listener presented (if any): pinned on acceptance.
    let client_leaf: Option<Vec<u8>> = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec());

    let mut conn = HttpConnection::new(tls);
    loop {
        let req = match tokio::time::timeout(READ_TIMEOUT, conn.read_request(MAX_PAIRING_BODY)).await
        {
            Err(_) => {
                debug!("[pairing] {} idle timeout", addr);
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Ok(Some(req))) => req,
            Ok(Err(HttpError::PayloadTooLarge)) => {
                let _ = conn.write_error(413, "payload_too_large", None).await;
                return;
            }
            Ok(Err(e)) => {
                debug!("[pairing] {} request error: {}", addr, e);
                return;
            }
        };

        match (req.method.as_str(), req.path()) {
            ("POST", "/pair") => {
                let msg: PairingMessage = match req.json() {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("[pairing] Bad pairing message from {}: {}", addr, e);
                        let _ = conn
                            .write_error(400, "internal", Some("malformed pairing message"))
                            .await;
                        continue;
                    }
                };
                match dispatch(&engine, &trust_store, client_leaf.as_deref(), msg).await {
                    Ok(reply) => {
                        if conn.write_json(200, &reply).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("[pairing] Trust store write failed: {}", e);
                        let _ = conn.write_error(500, "internal", None).await;
                        return;
                    }
                }
            }
            ("GET", "/pair") => match ws::validate_upgrade(&req) {
                Ok(client_key) => {
                    serve_ws(conn, client_key, client_leaf, engine, trust_store).await;
                    return;
                }
                Err(reason) => {
                    let _ = conn.write_error(426, "upgrade_required", Some(reason)).await;
                }
            },
            _ => {
                let _ = conn.write_error(404, "not_found", None).await;
            }
        }
    }
}

/// Same message set over a WebSocket: one reply frame per request frame.
async fn serve_ws(
    conn: HttpConnection<TlsServerStream>,
    client_key: String,
    client_leaf: Option<Vec<u8>>,
    engine: Arc<PairingEngine>,
    trust_store: Arc<TrustStore>,
) {
    let mut ws = match ws::complete_upgrade(conn, &client_key).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[pairing] WebSocket upgrade failed: {}", e);
            return;
        }
    };

    loop {
        let frame = match tokio::time::timeout(READ_TIMEOUT, ws.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("[pairing] WebSocket read error: {}", e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        if frame.is_close() {
            break;
        }

        let msgs = match ws::decode_frames::<PairingMessage>(&frame) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("[pairing] Bad pairing frame: {}", e);
                continue;
            }
        };
        for msg in msgs {
            let reply = match dispatch(&engine, &trust_store, client_leaf.as_deref(), msg).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("[pairing] Trust store write failed: {}", e);
                    return;
                }
            };
            let Ok(frame) = ws::encode_text(&reply) else {
                continue;
            };
            if ws.send(frame).await.is_err() {
                return;
            }
        }
    }
}

/// Route one pairing message through the engine; on acceptance, pin the
/// listener (with the TLS leaf it presented) before the reply goes out.
async fn dispatch(
    engine: &PairingEngine,
    trust_store: &TrustStore,
    client_leaf: Option<&[u8]>,
    msg: PairingMessage,
) -> std::io::Result<PairingMessage> {
    match msg {
        PairingMessage::PinPairingInit {
            listener_id,
            listener_name,
            protocol_version: _,
            listener_cert_fingerprint,
            pairing_token,
        } => Ok(engine.handle_init(
            &listener_id,
            &listener_name,
            &listener_cert_fingerprint,
            pairing_token.as_deref(),
        )),

        PairingMessage::PinSubmit {
            pairing_session_id,
            pake_msg_b,
            transcript,
            auth_tag,
        } => {
            let (reply, accepted) = engine
                .handle_submit(&pairing_session_id, &pake_msg_b, &transcript, &auth_tag)
                .await;
            if let Some(listener) = accepted {
                trust_store
                    .upsert(TrustedPeer::new(
                        listener.device_id,
                        listener.name,
                        listener.cert_fingerprint,
                        client_leaf,
                    ))
                    .await?;
            }
            Ok(reply)
        }

        // Server-originated message types arriving from a client.
        PairingMessage::PinRequired { .. }
        | PairingMessage::PairAccepted { .. }
        | PairingMessage::PairRejected { .. } => Ok(PairingMessage::PairRejected {
            reason: RejectReason::NoSession,
        }),
    }
}
