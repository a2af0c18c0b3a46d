//! Listener webhook delivery.
//!
//! The roles invert here: the listener runs the TLS server (its identity
//! certificate) and the monitor connects as an mTLS client with the
//! listener's fingerprint pinned — the same trust model as the control port,
//! pointing the other way. `reqwest` cannot pin a fingerprint, so delivery
//! rides the in-house TLS client path.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use cribcall_control::http::HttpConnection;
use cribcall_core::types::DetectedNoise;
use cribcall_identity::tls::{client_config, server_name, PinnedServerVerifier};
use cribcall_identity::DeviceIdentity;

pub const WEBHOOK_PATH: &str = "/api/noise-event";

/// `POST /api/noise-event` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub remote_device_id: String,
    pub monitor_name: String,
    pub timestamp: u64,
    pub peak_level: f32,
    pub subscription_id: String,
}

impl WebhookEvent {
    pub fn noise(
        monitor_id: &str,
        monitor_name: &str,
        event: DetectedNoise,
        subscription_id: &str,
    ) -> Self {
        Self {
            kind: "noise_event",
            remote_device_id: monitor_id.to_owned(),
            monitor_name: monitor_name.to_owned(),
            timestamp: event.timestamp_ms,
            peak_level: event.peak_level,
            subscription_id: subscription_id.to_owned(),
        }
    }
}

/// Where a listener's webhook lives, plus the fingerprint to pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub fingerprint: String,
}

impl WebhookEndpoint {
    /// Accepts `https://host:port[/path]` or bare `host:port[/path]`; the
    /// path defaults to `/api/noise-event`.
    pub fn parse(url: &str, fingerprint: &str) -> Option<Self> {
        let rest = url.strip_prefix("https://").unwrap_or(url);
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_owned()),
            None => (rest, WEBHOOK_PATH.to_owned()),
        };
        let (host, port) = authority.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_owned(),
            port,
            path,
            fingerprint: fingerprint.to_owned(),
        })
    }
}

#[derive(Clone)]
pub struct WebhookSender {
    identity: DeviceIdentity,
}

impl WebhookSender {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }

    pub async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        event: &WebhookEvent,
    ) -> anyhow::Result<()> {
        let verifier = PinnedServerVerifier::pinned(&endpoint.fingerprint);
        let config = client_config(Some(&self.identity), Arc::clone(&verifier))?;
        let connector = tokio_rustls::TlsConnector::from(config);

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .with_context(|| format!("webhook connect to {}:{}", endpoint.host, endpoint.port))?;
        tcp.set_nodelay(true)?;
        let tls = connector
            .connect(server_name(&endpoint.host)?, tcp)
            .await
            .with_context(|| format!("webhook TLS handshake with {}", endpoint.host))?;

        let mut conn = HttpConnection::new(tls);
        conn.write_request(
            "POST",
            &endpoint.path,
            &[],
            &serde_json::to_vec(event)?,
        )
        .await?;
        let resp = conn.read_response(16 * 1024).await?;
        anyhow::ensure!(resp.status == 200, "webhook returned {}", resp.status);
        debug!(
            "[webhook] Delivered noise event to {}:{}",
            endpoint.host, endpoint.port
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_forms() {
        let ep = WebhookEndpoint::parse("https://192.168.1.50:48082/api/noise-event", "fp").unwrap();
        assert_eq!(ep.host, "192.168.1.50");
        assert_eq!(ep.port, 48082);
        assert_eq!(ep.path, "/api/noise-event");
        assert_eq!(ep.fingerprint, "fp");

        let ep = WebhookEndpoint::parse("phone.local:9000", "fp").unwrap();
        assert_eq!(ep.host, "phone.local");
        assert_eq!(ep.port, 9000);
        assert_eq!(ep.path, WEBHOOK_PATH);

        assert!(WebhookEndpoint::parse("no-port-here", "fp").is_none());
        assert!(WebhookEndpoint::parse("https://:123", "fp").is_none());
    }

    #[test]
    fn event_body_shape() {
        let event = WebhookEvent::noise(
            "m1",
            "Nursery",
            DetectedNoise {
                timestamp_ms: 99,
                peak_level: 55.5,
            },
            "sub1",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "noise_event");
        assert_eq!(json["remoteDeviceId"], "m1");
        assert_eq!(json["monitorName"], "Nursery");
        assert_eq!(json["timestamp"], 99);
        assert_eq!(json["subscriptionId"], "sub1");
    }
}
