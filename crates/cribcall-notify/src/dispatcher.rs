//! Noise event fan-out.
//!
//! Three legs per DetectedNoise, in this order:
//! 1. broadcast to live trusted WebSockets (synchronous enqueue, bounded
//!    queues — the detector is never blocked),
//! 2. push batches for subscribed peers with no open socket right now,
//! 3. webhooks for trusted listeners with a configured endpoint.
//!
//! Legs 2 and 3 do network I/O and run on a task of their own per event;
//! their failures are logged and never terminate the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cribcall_control::{ControlServerHandle, NoiseSubscriptionRegistry};
use cribcall_core::types::{DetectedNoise, NoiseSubscription};
use cribcall_identity::DeviceIdentity;

use crate::push::{PushError, PushRelaySender, PushRequest, MAX_TOKENS_PER_REQUEST};
use crate::webhook::{WebhookEndpoint, WebhookEvent, WebhookSender};

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    pub monitor_id: String,
    pub monitor_name: String,
    pub push_relay_url: Option<String>,
    /// Listener webhook URLs keyed by certificate fingerprint.
    pub listener_webhooks: HashMap<String, String>,
}

pub struct EventDispatcher {
    config: DispatcherConfig,
    server: Arc<ControlServerHandle>,
    registry: Arc<NoiseSubscriptionRegistry>,
    push: Option<PushRelaySender>,
    webhook: WebhookSender,
}

impl EventDispatcher {
    pub fn new(
        config: DispatcherConfig,
        server: Arc<ControlServerHandle>,
        registry: Arc<NoiseSubscriptionRegistry>,
        identity: DeviceIdentity,
    ) -> Result<Self, PushError> {
        let push = match &config.push_relay_url {
            Some(url) => Some(PushRelaySender::new(url.clone())?),
            None => None,
        };
        Ok(Self {
            config,
            server,
            registry,
            push,
            webhook: WebhookSender::new(identity),
        })
    }

    /// Consume detector events until the channel closes.
    pub fn spawn(self, mut noise_rx: mpsc::Receiver<DetectedNoise>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("[dispatch] Event dispatcher running");
            while let Some(event) = noise_rx.recv().await {
                self.dispatch(event).await;
            }
            info!("[dispatch] Detector channel closed; dispatcher exiting");
        })
    }

    async fn dispatch(&self, event: DetectedNoise) {
        let delivered = self.server.broadcast_noise(event);
        debug!(
            "[dispatch] Noise at {} (peak {:.1}) → {} live socket(s)",
            event.timestamp_ms, event.peak_level, delivered
        );

        // Everything below leaves the hot path.
        let online = self.server.online_devices();
        let offline: Vec<NoiseSubscription> = self
            .registry
            .active()
            .await
            .into_iter()
            .filter(|sub| !online.contains(&sub.device_id))
            .collect();

        let push = self.push.clone();
        let registry = Arc::clone(&self.registry);
        let webhook = self.webhook.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Some(push) = push {
                for request in batch_push_requests(&config, event, &offline) {
                    match push.send(&request).await {
                        Ok(resp) => {
                            if let Err(e) = registry.remove_tokens(&resp.invalid_tokens).await {
                                warn!("[dispatch] Failed to prune invalid tokens: {}", e);
                            }
                        }
                        Err(e) => warn!("[dispatch] Push delivery failed: {}", e),
                    }
                }
            } else if !offline.is_empty() {
                debug!(
                    "[dispatch] {} offline subscription(s) but no push relay configured",
                    offline.len()
                );
            }

            for (fingerprint, url) in &config.listener_webhooks {
                let Some(endpoint) = WebhookEndpoint::parse(url, fingerprint) else {
                    warn!("[dispatch] Unparseable webhook URL for {}: {}", fingerprint, url);
                    continue;
                };
                let subscription_id = offline
                    .iter()
                    .find(|sub| &sub.cert_fingerprint == fingerprint)
                    .map(|sub| sub.subscription_id.clone())
                    .unwrap_or_default();
                let body = WebhookEvent::noise(
                    &config.monitor_id,
                    &config.monitor_name,
                    event,
                    &subscription_id,
                );
                if let Err(e) = webhook.deliver(&endpoint, &body).await {
                    warn!("[dispatch] Webhook to {} failed: {:#}", endpoint.host, e);
                }
            }
        });
    }
}

/// Split offline subscriptions into relay requests of at most 500 tokens.
/// Each request carries the first batched subscription's id.
fn batch_push_requests(
    config: &DispatcherConfig,
    event: DetectedNoise,
    offline: &[NoiseSubscription],
) -> Vec<PushRequest> {
    offline
        .chunks(MAX_TOKENS_PER_REQUEST)
        .map(|chunk| PushRequest {
            monitor_id: config.monitor_id.clone(),
            monitor_name: config.monitor_name.clone(),
            timestamp: event.timestamp_ms,
            peak_level: event.peak_level,
            subscription_id: chunk[0].subscription_id.clone(),
            fcm_token: chunk.iter().map(|sub| sub.fcm_token.clone()).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cribcall_core::types::PushPlatform;

    fn sub(n: usize) -> NoiseSubscription {
        NoiseSubscription {
            device_id: format!("device-{n}"),
            cert_fingerprint: format!("fp-{n}"),
            fcm_token: format!("token-{n}"),
            platform: PushPlatform::Android,
            subscription_id: format!("sub-{n}"),
            created_at_epoch_sec: 0,
            expires_at_epoch_sec: u64::MAX,
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            monitor_id: "m1".into(),
            monitor_name: "Nursery".into(),
            push_relay_url: None,
            listener_webhooks: HashMap::new(),
        }
    }

    #[test]
    fn batches_cap_at_500_tokens() {
        let subs: Vec<_> = (0..1101).map(sub).collect();
        let event = DetectedNoise {
            timestamp_ms: 5,
            peak_level: 60.0,
        };
        let requests = batch_push_requests(&config(), event, &subs);

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].fcm_token.len(), 500);
        assert_eq!(requests[1].fcm_token.len(), 500);
        assert_eq!(requests[2].fcm_token.len(), 101);
        assert_eq!(requests[0].subscription_id, "sub-0");
        assert_eq!(requests[1].subscription_id, "sub-500");
        assert_eq!(requests[0].timestamp, 5);
    }

    #[test]
    fn no_subscriptions_means_no_requests() {
        let event = DetectedNoise {
            timestamp_ms: 5,
            peak_level: 60.0,
        };
        assert!(batch_push_requests(&config(), event, &[]).is_empty());
    }
}
