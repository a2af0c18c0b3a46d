//! Monitor runtime: identity → trust → servers → detector → fan-out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cribcall_audio::{AudioSource, SoundDetector, DEFAULT_FRAME_SAMPLES, DEFAULT_SAMPLE_RATE};
use cribcall_control::{
    ControlMessage, ControlServer, ControlServerContext, ControlServerEvent,
    NoiseSubscriptionRegistry,
};
use cribcall_core::canonical::canonical_json;
use cribcall_core::types::{DeviceRole, QrPayload, ServiceDescriptor};
use cribcall_core::{AppSession, MonitorSettings};
use cribcall_discovery::{detect_local_ip, MonitorAdvertiser};
use cribcall_identity::tls::TlsAcceptance;
use cribcall_identity::{DeviceIdentity, TrustStore};
use cribcall_notify::{DispatcherConfig, EventDispatcher};
use cribcall_pairing::{PairingEngine, PairingPrompt, PairingServer};

use crate::cli::MonitorArgs;
use crate::services::ServiceCoordinator;

pub async fn run(args: MonitorArgs) -> Result<()> {
    let data_dir: PathBuf = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from("cribcall-data").join("monitor"));

    // Declared wiring; a bad edit here fails fast instead of deadlocking at
    // runtime.
    ServiceCoordinator::resolve(&[
        ("identity", &[]),
        ("trust-store", &["identity"]),
        ("registry", &["identity"]),
        ("pairing-server", &["identity", "trust-store"]),
        ("control-server", &["identity", "trust-store", "registry"]),
        ("detector", &[]),
        ("dispatcher", &["control-server", "registry"]),
        ("mdns", &["control-server", "pairing-server"]),
    ])?;
    let mut coordinator = ServiceCoordinator::new();

    // ── Identity & persistent state ───────────────────────────────────────────
    let identity = DeviceIdentity::load_or_create(&data_dir).await?;
    let settings = MonitorSettings::load(&data_dir).await?;
    // Materialise the file on first run so it can be edited in place.
    settings.store(&data_dir).await?;
    let monitor_name = args
        .name
        .clone()
        .or_else(|| settings.device_name.clone())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "CribCall Monitor".to_owned());

    AppSession {
        last_role: Some(DeviceRole::Monitor),
        monitoring_enabled: true,
        device_name: Some(monitor_name.clone()),
    }
    .store(&data_dir)
    .await?;

    let trust_store = TrustStore::open(&data_dir, DeviceRole::Monitor).await?;
    let registry = NoiseSubscriptionRegistry::open(&data_dir).await?;
    let sweeper = registry.spawn_sweeper();
    coordinator.register("registry", move || sweeper.abort());

    // ── Pairing ───────────────────────────────────────────────────────────────
    let (engine, prompt_rx) = PairingEngine::new(identity.device_id(), identity.cert_fingerprint());
    spawn_console_approver(prompt_rx);

    let pairing_tcp = TcpListener::bind(("0.0.0.0", args.pairing_port))
        .await
        .with_context(|| format!("binding pairing port {}", args.pairing_port))?;
    let (_, pairing_join) = PairingServer::start(
        Arc::clone(&engine),
        &identity,
        Arc::clone(&trust_store),
        pairing_tcp,
    )
    .await?;
    coordinator.register("pairing-server", move || pairing_join.abort());

    // ── Control ───────────────────────────────────────────────────────────────
    let acceptance = TlsAcceptance::new(trust_store.snapshot());
    let control_tcp = TcpListener::bind(("0.0.0.0", args.control_port))
        .await
        .with_context(|| format!("binding control port {}", args.control_port))?;
    let ctx = ControlServerContext {
        role: DeviceRole::Monitor,
        identity: identity.clone(),
        trust_store: Arc::clone(&trust_store),
        registry: Arc::clone(&registry),
        acceptance,
    };
    let (control_handle, event_rx, control_join) = ControlServer::start(ctx, control_tcp).await?;
    coordinator.register("control-server", move || control_join.abort());

    let stream_responder = Arc::clone(&control_handle);
    let events_join = tokio::spawn(async move {
        handle_control_events(event_rx, stream_responder).await;
    });
    coordinator.register("control-events", move || events_join.abort());

    // ── Startup banner: what a listener needs to pair ─────────────────────────
    let local_ip = detect_local_ip();
    let qr = QrPayload {
        monitor_id: identity.device_id().to_owned(),
        monitor_name: monitor_name.clone(),
        monitor_cert_fingerprint: identity.cert_fingerprint().to_owned(),
        monitor_public_key: identity.public_key_base64(),
        ips: Some(vec![local_ip.to_string()]),
        pairing_token: None,
        service: ServiceDescriptor::new(args.control_port, args.pairing_port),
    };
    info!("Certificate fingerprint: {}", identity.cert_fingerprint());
    info!("QR payload: {}", canonical_json(&qr)?);

    // ── Sound detection → dispatch ────────────────────────────────────────────
    let source = if args.synthetic_noise {
        AudioSource::SyntheticBursts {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            amplitude: 12_000,
            burst_ms: 500,
            interval_ms: 15_000,
        }
    } else {
        AudioSource::Silence {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    };
    let sample_rate = source.sample_rate();
    let mut frames = source.spawn();

    let (noise_tx, noise_rx) = mpsc::channel(64);
    let noise_settings = settings.noise.clone();
    let detector_join = tokio::spawn(async move {
        let mut detector = SoundDetector::new(noise_settings, sample_rate);
        while let Some(frame) = frames.recv().await {
            if let Some(event) = detector.process_frame(&frame) {
                info!(
                    "Noise detected (peak {:.1}) at {}",
                    event.peak_level, event.timestamp_ms
                );
                // Never block on a slow dispatcher.
                if noise_tx.try_send(event).is_err() {
                    warn!("Dispatcher queue full; noise event dropped");
                }
            }
        }
    });
    coordinator.register("detector", move || detector_join.abort());

    let dispatcher = EventDispatcher::new(
        DispatcherConfig {
            monitor_id: identity.device_id().to_owned(),
            monitor_name: monitor_name.clone(),
            push_relay_url: settings.push_relay_url.clone(),
            listener_webhooks: settings.listener_webhooks.clone(),
        },
        Arc::clone(&control_handle),
        Arc::clone(&registry),
        identity.clone(),
    )?;
    let dispatcher_join = dispatcher.spawn(noise_rx);
    coordinator.register("dispatcher", move || dispatcher_join.abort());

    // ── mDNS ──────────────────────────────────────────────────────────────────
    match MonitorAdvertiser::register(
        identity.device_id(),
        &monitor_name,
        identity.cert_fingerprint(),
        args.control_port,
        args.pairing_port,
        local_ip,
    ) {
        Ok(advertiser) => coordinator.register("mdns", move || advertiser.unregister()),
        Err(e) => warn!("mDNS advertisement unavailable: {}", e),
    }

    info!(
        "Monitor '{}' ready (control :{}, pairing :{})",
        monitor_name, args.control_port, args.pairing_port
    );

    crate::shutdown_signal().await;
    coordinator.shutdown();
    Ok(())
}

/// Console stand-in for the confirmation UI: prints the PIN, prints the
/// comparison code, and auto-confirms.
fn spawn_console_approver(mut prompts: mpsc::Receiver<PairingPrompt>) {
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            match prompt {
                PairingPrompt::DisplayPin { session_id, pin } => {
                    info!("╔══════════════════════════════════════╗");
                    info!("║  CribCall Pairing PIN:  {}        ║", pin);
                    info!("╚══════════════════════════════════════╝");
                    info!("(session {})", session_id);
                }
                PairingPrompt::Confirm {
                    listener_name,
                    comparison_code,
                    reply,
                    ..
                } => {
                    info!(
                        "Pairing request from '{}' — comparison code {} (auto-confirmed)",
                        listener_name, comparison_code
                    );
                    let _ = reply.send(true);
                }
            }
        }
    });
}

/// Answer stream requests (no media back-end in the harness) and log the
/// rest.
async fn handle_control_events(
    mut events: mpsc::Receiver<ControlServerEvent>,
    handle: Arc<cribcall_control::ControlServerHandle>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ControlServerEvent::PeerConnected { device_id, .. } => {
                info!("Listener {} connected", device_id);
            }
            ControlServerEvent::PeerDisconnected {
                device_id,
                terminated_sessions,
                ..
            } => {
                if terminated_sessions.is_empty() {
                    info!("Listener {} disconnected", device_id);
                } else {
                    info!(
                        "Listener {} disconnected; terminated sessions: {}",
                        device_id,
                        terminated_sessions.join(", ")
                    );
                }
            }
            ControlServerEvent::StreamMessage {
                connection_id,
                message,
                ..
            } => match message {
                ControlMessage::StartStreamRequest { session_id, .. } => {
                    handle.send_to_connection(
                        connection_id,
                        ControlMessage::StartStreamResponse {
                            session_id,
                            accepted: false,
                            reason: Some("media streaming not available in this build".into()),
                        },
                    );
                }
                other => {
                    info!("Control message from conn {}: {:?}", connection_id, other);
                }
            },
        }
    }
}
