//! Webhook delivery over real mTLS: the listener runs the server, the
//! monitor connects as a pinned client.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use cribcall_control::http::HttpConnection;
use cribcall_core::types::{sha256_hex, DetectedNoise, TrustedPeer};
use cribcall_identity::tls::{mtls_server_config, TlsAcceptance};
use cribcall_identity::DeviceIdentity;
use cribcall_notify::{WebhookEndpoint, WebhookEvent, WebhookSender};

/// Listener-side webhook stub: mTLS server accepting only the monitor's
/// fingerprint, answering one POST /api/noise-event.
async fn spawn_webhook_server(
    listener_identity: &DeviceIdentity,
    monitor: &DeviceIdentity,
) -> (u16, tokio::sync::oneshot::Receiver<serde_json::Value>) {
    let monitor_peer = TrustedPeer::new(
        "monitor-1",
        "Nursery",
        monitor.cert_fingerprint(),
        Some(monitor.certificate_der()),
    );
    let snapshot = Arc::new(RwLock::new(HashMap::from([(
        monitor.cert_fingerprint().to_owned(),
        monitor_peer,
    )])));
    let acceptance = TlsAcceptance::new(snapshot);
    let config = mtls_server_config(listener_identity, acceptance).unwrap();
    let acceptor = TlsAcceptor::from(config);

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = tcp.local_addr().unwrap().port();
    let (body_tx, body_rx) = tokio::sync::oneshot::channel();
    let expected_fp = monitor.cert_fingerprint().to_owned();

    tokio::spawn(async move {
        let (stream, _) = tcp.accept().await.unwrap();
        // An untrusted client dies here; nothing to serve then.
        let Ok(tls) = acceptor.accept(stream).await else {
            return;
        };

        // Only trusted monitor fingerprints get this far; double-check.
        let presented = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| sha256_hex(cert.as_ref()))
            .unwrap();
        assert_eq!(presented, expected_fp);

        let mut conn = HttpConnection::new(tls);
        let req = conn.read_request(16 * 1024).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path(), "/api/noise-event");
        let body: serde_json::Value = req.json().unwrap();
        conn.write_json(200, &serde_json::json!({"status": "ok"}))
            .await
            .unwrap();
        let _ = body_tx.send(body);
    });

    (port, body_rx)
}

#[tokio::test]
async fn trusted_monitor_delivers_noise_event() {
    let monitor = DeviceIdentity::generate().unwrap();
    let listener = DeviceIdentity::generate().unwrap();
    let (port, body_rx) = spawn_webhook_server(&listener, &monitor).await;

    let endpoint = WebhookEndpoint::parse(
        &format!("https://127.0.0.1:{port}/api/noise-event"),
        listener.cert_fingerprint(),
    )
    .unwrap();
    let event = WebhookEvent::noise(
        "monitor-1",
        "Nursery",
        DetectedNoise {
            timestamp_ms: 4242,
            peak_level: 66.0,
        },
        "sub-1",
    );

    WebhookSender::new(monitor.clone())
        .deliver(&endpoint, &event)
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), body_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["type"], "noise_event");
    assert_eq!(body["remoteDeviceId"], "monitor-1");
    assert_eq!(body["timestamp"], 4242);
    assert_eq!(body["peakLevel"], 66.0);
    assert_eq!(body["subscriptionId"], "sub-1");
}

#[tokio::test]
async fn untrusted_monitor_fails_the_handshake() {
    let monitor = DeviceIdentity::generate().unwrap();
    let listener = DeviceIdentity::generate().unwrap();
    let stranger = DeviceIdentity::generate().unwrap();
    let (port, _body_rx) = spawn_webhook_server(&listener, &monitor).await;

    let endpoint = WebhookEndpoint::parse(
        &format!("127.0.0.1:{port}"),
        listener.cert_fingerprint(),
    )
    .unwrap();
    let event = WebhookEvent::noise(
        "stranger",
        "Stranger",
        DetectedNoise {
            timestamp_ms: 1,
            peak_level: 1.0,
        },
        "",
    );

    let result = WebhookSender::new(stranger).deliver(&endpoint, &event).await;
    assert!(result.is_err());
}
