//! Listener runtime: pair (when a PIN is given), subscribe, consume events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cribcall_control::{ControlClient, ControlMessage};
use cribcall_core::types::{DeviceRole, PushPlatform};
use cribcall_core::{AppSession, ListenerSettings};
use cribcall_discovery::DiscoveryService;
use cribcall_identity::{DeviceIdentity, TrustStore};
use cribcall_pairing::PairingClient;

use crate::cli::ListenerArgs;

pub async fn run(args: ListenerArgs) -> Result<()> {
    let data_dir: PathBuf = args
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("cribcall-data").join("listener"));

    let identity = DeviceIdentity::load_or_create(&data_dir).await?;
    let settings = ListenerSettings::load(&data_dir).await?;
    settings.store(&data_dir).await?;
    let listener_name = args
        .name
        .clone()
        .or_else(|| settings.device_name.clone())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "CribCall Listener".to_owned());

    AppSession {
        last_role: Some(DeviceRole::Listener),
        monitoring_enabled: false,
        device_name: Some(listener_name.clone()),
    }
    .store(&data_dir)
    .await?;

    // ── One-shot health probe ─────────────────────────────────────────────────
    if args.ping {
        let client = ControlClient::new(
            args.host.as_str(),
            args.control_port,
            args.fingerprint.as_str(),
            Some(identity),
        );
        let health = client.health_check().await?;
        info!(
            "Health: {} (role {}, protocol {}, mTLS {}, trusted {}, up {}s)",
            health.status,
            health.role,
            health.protocol,
            health.m_tls,
            health.trusted,
            health.uptime_seconds
        );
        return Ok(());
    }

    let trust_store = TrustStore::open(&data_dir, DeviceRole::Listener).await?;

    // ── Pair first when a PIN was supplied ────────────────────────────────────
    if let Some(pin) = &args.pin {
        pair(&args, &identity, &trust_store, &listener_name, pin).await?;
    }

    let monitor = trust_store
        .lookup_by_fingerprint(&args.fingerprint)
        .context("monitor is not in the trust store; pair first with --pin")?;
    trust_store
        .update_last_known_ip(&args.fingerprint, &args.host)
        .await?;

    // ── Subscribe + live stream ───────────────────────────────────────────────
    let client = ControlClient::new(
        args.host.as_str(),
        args.control_port,
        args.fingerprint.as_str(),
        Some(identity.clone()),
    );

    let fcm_token = settings
        .fcm_token
        .clone()
        .unwrap_or_else(|| format!("dev-token-{}", identity.device_id()));
    match client
        .subscribe_noise(&fcm_token, PushPlatform::Web, None)
        .await
    {
        Ok(ack) => info!(
            "Subscribed ({}, lease {}s, expires {})",
            &ack.subscription_id[..16],
            ack.accepted_lease_seconds,
            ack.expires_at
        ),
        Err(e) => warn!("Noise subscription failed: {:#}", e),
    }

    let mut stream = client.open_control_stream().await?;
    info!(
        "Connected to monitor '{}' ({}) — waiting for noise events",
        monitor.name, monitor.remote_device_id
    );

    loop {
        tokio::select! {
            message = stream.incoming.recv() => {
                let Some(message) = message else {
                    warn!("Control stream closed by monitor");
                    break;
                };
                match message {
                    ControlMessage::NoiseEvent { timestamp_ms, peak_level } => {
                        info!("NOISE from '{}': peak {:.1} at {}", monitor.name, peak_level, timestamp_ms);
                        trust_store
                            .update_last_noise(&args.fingerprint, timestamp_ms)
                            .await?;
                    }
                    other => info!("Control message: {:?}", other),
                }
            }
            _ = crate::shutdown_signal() => break,
        }
    }
    stream.close();
    Ok(())
}

async fn pair(
    args: &ListenerArgs,
    identity: &DeviceIdentity,
    trust_store: &Arc<TrustStore>,
    listener_name: &str,
    pin: &str,
) -> Result<()> {
    // The transcript binds the monitor's device id, which only discovery (or
    // the QR payload) knows — browse briefly and match by fingerprint.
    let (monitor_id, monitor_name) = discover_monitor(&args.fingerprint)
        .await
        .context("monitor not found via mDNS; is it running on this network?")?;

    let pairing = PairingClient::new(
        args.host.as_str(),
        args.pairing_port,
        identity.clone(),
        listener_name,
    );
    let handshake = pairing.begin(&monitor_id, &monitor_name, None).await?;

    // The leaf we observed must be the certificate we were told to expect.
    anyhow::ensure!(
        handshake.monitor_fingerprint() == args.fingerprint,
        "monitor presented fingerprint {}, expected {}",
        handshake.monitor_fingerprint(),
        args.fingerprint
    );

    let outcome = handshake.submit_pin(pin).await?;
    info!(
        "Paired with '{}' — comparison code {} (verify it matches the monitor)",
        monitor_name, outcome.comparison_code
    );
    trust_store.upsert(outcome.monitor).await?;
    Ok(())
}

/// Browse mDNS for a monitor advertising the pinned fingerprint.
async fn discover_monitor(fingerprint: &str) -> Option<(String, String)> {
    let mut discovery = DiscoveryService::new();
    let mut monitors = discovery.start_browsing().ok()?;

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    let found = loop {
        tokio::select! {
            advertisement = monitors.recv() => {
                match advertisement {
                    Some(ad) if ad.cert_fingerprint == fingerprint => {
                        break Some((ad.remote_device_id, ad.monitor_name));
                    }
                    Some(ad) => {
                        info!("[mDNS] Skipping monitor '{}' (different fingerprint)", ad.monitor_name);
                    }
                    None => break None,
                }
            }
            _ = &mut deadline => break None,
        }
    };
    discovery.stop();
    found
}
