//! End-to-end control server tests over real localhost TLS sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use cribcall_control::http::HttpConnection;
use cribcall_control::{
    ControlClient, ControlMessage, ControlServer, ControlServerContext, ControlServerEvent,
    ControlServerHandle, NoiseSubscriptionRegistry, StreamType,
};
use cribcall_core::types::{DetectedNoise, DeviceRole, PushPlatform, TrustedPeer};
use cribcall_identity::tls::{client_config, server_name, PinnedServerVerifier, TlsAcceptance};
use cribcall_identity::{DeviceIdentity, TrustStore};

const LISTENER_DEVICE_ID: &str = "listener-device-123";

struct Fixture {
    _dir: tempfile::TempDir,
    monitor: DeviceIdentity,
    listener: DeviceIdentity,
    handle: Arc<ControlServerHandle>,
    events: tokio::sync::mpsc::Receiver<ControlServerEvent>,
    port: u16,
}

async fn start_monitor() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let monitor = DeviceIdentity::generate().unwrap();
    let listener = DeviceIdentity::generate().unwrap();

    let trust_store = TrustStore::open(dir.path(), DeviceRole::Monitor)
        .await
        .unwrap();
    trust_store
        .upsert(TrustedPeer::new(
            LISTENER_DEVICE_ID,
            "Test Listener",
            listener.cert_fingerprint(),
            Some(listener.certificate_der()),
        ))
        .await
        .unwrap();

    let registry = NoiseSubscriptionRegistry::open(dir.path()).await.unwrap();
    let acceptance = TlsAcceptance::new(trust_store.snapshot());

    let ctx = ControlServerContext {
        role: DeviceRole::Monitor,
        identity: monitor.clone(),
        trust_store,
        registry,
        acceptance,
    };
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = tcp.local_addr().unwrap().port();
    let (handle, events, _join) = ControlServer::start(ctx, tcp).await.unwrap();

    Fixture {
        _dir: dir,
        monitor,
        listener,
        handle,
        events,
        port,
    }
}

/// Raw keep-alive HTTP connection presenting the listener certificate.
async fn raw_trusted_conn(
    fx: &Fixture,
) -> HttpConnection<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> {
    let verifier = PinnedServerVerifier::pinned(fx.monitor.cert_fingerprint());
    let config = client_config(Some(&fx.listener), verifier).unwrap();
    let connector = tokio_rustls::TlsConnector::from(config);
    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", fx.port))
        .await
        .unwrap();
    let tls = connector
        .connect(server_name("127.0.0.1").unwrap(), tcp)
        .await
        .unwrap();
    HttpConnection::new(tls)
}

#[tokio::test]
async fn health_without_client_cert() {
    let fx = start_monitor().await;
    let client = ControlClient::new("127.0.0.1", fx.port, fx.monitor.cert_fingerprint(), None);

    let health = client.health_check().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.role, "monitor");
    assert_eq!(health.protocol, "http-ws");
    assert!(!health.m_tls);
    assert!(!health.trusted);
}

#[tokio::test]
async fn health_with_trusted_cert() {
    let fx = start_monitor().await;
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        fx.monitor.cert_fingerprint(),
        Some(fx.listener.clone()),
    );

    let health = client.health_check().await.unwrap();
    assert!(health.m_tls);
    assert!(health.trusted);
}

#[tokio::test]
async fn unknown_client_certificate_fails_handshake() {
    let fx = start_monitor().await;
    let stranger = DeviceIdentity::generate().unwrap();
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        fx.monitor.cert_fingerprint(),
        Some(stranger),
    );
    assert!(client.health_check().await.is_err());
}

#[tokio::test]
async fn wrong_pin_aborts_with_fingerprint_mismatch() {
    let fx = start_monitor().await;
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        "00".repeat(32),
        Some(fx.listener.clone()),
    );
    let err = client.health_check().await.unwrap_err();
    assert!(err
        .chain()
        .any(|cause| cause.to_string().contains("fingerprint")));
}

#[tokio::test]
async fn unpair_is_idempotent_per_connection() {
    let fx = start_monitor().await;
    let mut conn = raw_trusted_conn(&fx).await;
    let body = format!(r#"{{"deviceId":"{LISTENER_DEVICE_ID}"}}"#);

    conn.write_request("POST", "/unpair", &[], body.as_bytes())
        .await
        .unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 200);
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["unpaired"], true);
    assert_eq!(value["deviceId"], LISTENER_DEVICE_ID);

    // Same keep-alive connection: the peer is already gone.
    conn.write_request("POST", "/unpair", &[], body.as_bytes())
        .await
        .unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 200);
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["unpaired"], false);
    assert_eq!(value["reason"], "device_not_found");
}

#[tokio::test]
async fn subscribe_replay_yields_same_id() {
    let fx = start_monitor().await;
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        fx.monitor.cert_fingerprint(),
        Some(fx.listener.clone()),
    );

    let first = client
        .subscribe_noise("token123", PushPlatform::Android, None)
        .await
        .unwrap();
    assert_eq!(first.device_id, LISTENER_DEVICE_ID);
    assert_eq!(first.accepted_lease_seconds, 3600);
    assert_eq!(first.subscription_id.len(), 64);
    assert!(first.expires_at.ends_with('Z'));

    let second = client
        .subscribe_noise("token123", PushPlatform::Android, None)
        .await
        .unwrap();
    assert_eq!(second.subscription_id, first.subscription_id);
}

#[tokio::test]
async fn subscribe_with_device_id_is_forbidden() {
    let fx = start_monitor().await;
    let mut conn = raw_trusted_conn(&fx).await;

    conn.write_request(
        "POST",
        "/noise/subscribe",
        &[],
        br#"{"fcmToken":"t","platform":"android","deviceId":"spoof"}"#,
    )
    .await
    .unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 400);
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["error"], "device_id_forbidden");
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let fx = start_monitor().await;
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        fx.monitor.cert_fingerprint(),
        Some(fx.listener.clone()),
    );

    client
        .subscribe_noise("tok", PushPlatform::Web, None)
        .await
        .unwrap();
    assert!(client.unsubscribe_noise(Some("tok"), None).await.unwrap());
    assert!(!client.unsubscribe_noise(Some("tok"), None).await.unwrap());
}

#[tokio::test]
async fn unsubscribe_without_identifier_is_rejected() {
    let fx = start_monitor().await;
    let mut conn = raw_trusted_conn(&fx).await;

    conn.write_request("POST", "/noise/unsubscribe", &[], b"{}")
        .await
        .unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 400);
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["error"], "missing_identifier");
}

#[tokio::test]
async fn control_stream_carries_noise_and_stream_messages() {
    let mut fx = start_monitor().await;
    let client = ControlClient::new(
        "127.0.0.1",
        fx.port,
        fx.monitor.cert_fingerprint(),
        Some(fx.listener.clone()),
    );

    let mut stream = client.open_control_stream().await.unwrap();

    // Wait until the server has registered the connection.
    for _ in 0..50 {
        if fx.handle.connection_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fx.handle.connection_count(), 1);
    assert!(fx.handle.is_online(LISTENER_DEVICE_ID));

    // Monitor-side broadcast reaches the listener in order.
    let sent = fx.handle.broadcast_noise(DetectedNoise {
        timestamp_ms: 11,
        peak_level: 61.0,
    });
    assert_eq!(sent, 1);
    fx.handle.broadcast_noise(DetectedNoise {
        timestamp_ms: 12,
        peak_level: 62.0,
    });

    let first = tokio::time::timeout(Duration::from_secs(5), stream.incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        first,
        ControlMessage::NoiseEvent {
            timestamp_ms: 11,
            peak_level: 61.0
        }
    );
    let second = tokio::time::timeout(Duration::from_secs(5), stream.incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        second,
        ControlMessage::NoiseEvent {
            timestamp_ms: 12,
            peak_level: 62.0
        }
    );

    // Listener-side stream request surfaces as a server event.
    stream
        .outgoing
        .send(ControlMessage::StartStreamRequest {
            session_id: "sess-1".into(),
            stream_type: StreamType::Audio,
        })
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ControlServerEvent::StreamMessage { message, device_id, .. } => {
                assert_eq!(device_id, LISTENER_DEVICE_ID);
                assert_eq!(
                    message,
                    ControlMessage::StartStreamRequest {
                        session_id: "sess-1".into(),
                        stream_type: StreamType::Audio,
                    }
                );
                break;
            }
            ControlServerEvent::PeerConnected { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }

    // Dropping the stream terminates the owned session server-side.
    stream.close();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ControlServerEvent::PeerDisconnected {
            terminated_sessions, ..
        } = event
        {
            assert_eq!(terminated_sessions, vec!["sess-1".to_owned()]);
            break;
        }
    }
}

#[tokio::test]
async fn websocket_upgrade_requires_trusted_cert_and_headers() {
    let fx = start_monitor().await;

    // Trusted cert but no upgrade headers → 426.
    let mut conn = raw_trusted_conn(&fx).await;
    conn.write_request("GET", "/control/ws", &[], b"").await.unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 426);

    // No client cert → 401 before any upgrade processing.
    let verifier = PinnedServerVerifier::pinned(fx.monitor.cert_fingerprint());
    let config = client_config(None, verifier).unwrap();
    let connector = tokio_rustls::TlsConnector::from(config);
    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", fx.port))
        .await
        .unwrap();
    let tls = connector
        .connect(server_name("127.0.0.1").unwrap(), tcp)
        .await
        .unwrap();
    let mut conn = HttpConnection::new(tls);
    conn.write_request("GET", "/control/ws", &[], b"").await.unwrap();
    let resp = conn.read_response(64 * 1024).await.unwrap();
    assert_eq!(resp.status, 401);
    let value: serde_json::Value = resp.json().unwrap();
    assert_eq!(value["error"], "client_certificate_required");
}
