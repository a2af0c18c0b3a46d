//! End-to-end pairing over real localhost TLS sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use cribcall_core::types::DeviceRole;
use cribcall_identity::{DeviceIdentity, TrustStore};
use cribcall_pairing::{PairingClient, PairingEngine, PairingPrompt, PairingServer};

struct Fixture {
    _dir: tempfile::TempDir,
    monitor: DeviceIdentity,
    listener: DeviceIdentity,
    trust_store: Arc<TrustStore>,
    prompts: mpsc::Receiver<PairingPrompt>,
    port: u16,
}

async fn start_monitor() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let monitor = DeviceIdentity::generate().unwrap();
    let listener = DeviceIdentity::generate().unwrap();

    let trust_store = TrustStore::open(dir.path(), DeviceRole::Monitor)
        .await
        .unwrap();
    let (engine, prompts) =
        PairingEngine::new(monitor.device_id(), monitor.cert_fingerprint());

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _join) = PairingServer::start(engine, &monitor, Arc::clone(&trust_store), tcp)
        .await
        .unwrap();

    Fixture {
        _dir: dir,
        monitor,
        listener,
        trust_store,
        prompts,
        port: addr.port(),
    }
}

async fn next_pin(prompts: &mut mpsc::Receiver<PairingPrompt>) -> String {
    match tokio::time::timeout(Duration::from_secs(5), prompts.recv())
        .await
        .unwrap()
        .unwrap()
    {
        PairingPrompt::DisplayPin { pin, .. } => pin,
        other => panic!("expected DisplayPin, got {other:?}"),
    }
}

/// Answer the next Confirm prompt with `accept`; returns the displayed code.
fn spawn_confirmer(
    mut prompts: mpsc::Receiver<PairingPrompt>,
    accept: bool,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        loop {
            match prompts.recv().await.expect("prompt channel closed") {
                PairingPrompt::Confirm {
                    comparison_code,
                    reply,
                    ..
                } => {
                    let _ = reply.send(accept);
                    return comparison_code;
                }
                PairingPrompt::DisplayPin { .. } => continue,
            }
        }
    })
}

#[tokio::test]
async fn full_pairing_flow_pins_both_sides() {
    let mut fx = start_monitor().await;

    let client = PairingClient::new(
        "127.0.0.1",
        fx.port,
        fx.listener.clone(),
        "Parent Phone",
    );
    let handshake = client
        .begin(fx.monitor.device_id(), "Nursery Monitor", None)
        .await
        .unwrap();
    assert_eq!(handshake.monitor_fingerprint(), fx.monitor.cert_fingerprint());

    let pin = next_pin(&mut fx.prompts).await;
    let confirmer = spawn_confirmer(fx.prompts, true);

    let outcome = handshake.submit_pin(&pin).await.unwrap();

    // Listener side: the monitor record carries the observed TLS leaf.
    assert_eq!(
        outcome.monitor.cert_fingerprint,
        fx.monitor.cert_fingerprint()
    );
    assert_eq!(
        outcome.monitor.certificate_der_bytes().unwrap(),
        fx.monitor.certificate_der()
    );
    assert_eq!(outcome.monitor.remote_device_id, fx.monitor.device_id());

    // Both humans saw the same 6-digit code.
    let monitor_code = confirmer.await.unwrap();
    assert_eq!(outcome.comparison_code, monitor_code);

    // Monitor side: the listener is pinned, including its client leaf.
    let pinned = fx
        .trust_store
        .lookup_by_fingerprint(fx.listener.cert_fingerprint())
        .expect("listener should be trusted after pairing");
    assert_eq!(pinned.remote_device_id, fx.listener.device_id());
    assert_eq!(pinned.name, "Parent Phone");
    assert_eq!(
        pinned.certificate_der_bytes().unwrap(),
        fx.listener.certificate_der()
    );
}

#[tokio::test]
async fn wrong_pin_is_rejected() {
    let mut fx = start_monitor().await;

    let client = PairingClient::new("127.0.0.1", fx.port, fx.listener.clone(), "Phone");
    let handshake = client
        .begin(fx.monitor.device_id(), "Nursery", None)
        .await
        .unwrap();

    let pin = next_pin(&mut fx.prompts).await;
    let wrong = if pin == "000000" { "000001" } else { "000000" };

    let err = handshake.submit_pin(wrong).await.unwrap_err();
    assert!(err.to_string().contains("pair_invalid_pin"));
    assert!(fx
        .trust_store
        .lookup_by_fingerprint(fx.listener.cert_fingerprint())
        .is_none());
}

#[tokio::test]
async fn user_rejection_leaves_no_trust() {
    let mut fx = start_monitor().await;

    let client = PairingClient::new("127.0.0.1", fx.port, fx.listener.clone(), "Phone");
    let handshake = client
        .begin(fx.monitor.device_id(), "Nursery", None)
        .await
        .unwrap();

    let pin = next_pin(&mut fx.prompts).await;
    let _confirmer = spawn_confirmer(fx.prompts, false);

    let err = handshake.submit_pin(&pin).await.unwrap_err();
    assert!(err.to_string().contains("pair_user_rejected"));
    assert!(fx.trust_store.list().await.is_empty());
}

#[tokio::test]
async fn token_gated_pairing_burns_the_token() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = DeviceIdentity::generate().unwrap();
    let listener = DeviceIdentity::generate().unwrap();
    let trust_store = TrustStore::open(dir.path(), DeviceRole::Monitor)
        .await
        .unwrap();
    let (engine, mut prompts) =
        PairingEngine::new(monitor.device_id(), monitor.cert_fingerprint());
    let token = engine.issue_token();

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (addr, _join) =
        PairingServer::start(Arc::clone(&engine), &monitor, trust_store, tcp)
            .await
            .unwrap();

    let client = PairingClient::new("127.0.0.1", addr.port(), listener.clone(), "Phone");

    // Valid token: session opens.
    let handshake = client
        .begin(monitor.device_id(), "Nursery", Some(&token))
        .await
        .unwrap();
    let _pin = next_pin(&mut prompts).await;
    drop(handshake);

    // The token burned on first use.
    let err = client
        .begin(monitor.device_id(), "Nursery", Some(&token))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("pair_no_session"));
}
