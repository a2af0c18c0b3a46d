//! Noise subscription registry: in-memory map with a disk-backed mirror.
//!
//! Keyed by `subscriptionId = sha256(deviceId|fcmToken)` so replays are
//! idempotent; every mutation rewrites `noise_subscriptions.json` atomically.
//! A periodic sweep evicts expired leases. Subscriptions survive reconnects —
//! only expiry or an explicit unsubscribe removes them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cribcall_core::storage;
use cribcall_core::types::{epoch_sec, NoiseSubscription, PushPlatform};

pub const DEFAULT_LEASE_SECONDS: u64 = 3600;
pub const MAX_LEASE_SECONDS: u64 = 86_400;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct NoiseSubscriptionRegistry {
    path: PathBuf,
    subs: RwLock<HashMap<String, NoiseSubscription>>,
}

impl NoiseSubscriptionRegistry {
    pub async fn open(dir: &std::path::Path) -> std::io::Result<Arc<Self>> {
        let path = dir.join(storage::NOISE_SUBSCRIPTIONS_FILE);
        let stored: Vec<NoiseSubscription> =
            storage::read_json(&path).await?.unwrap_or_default();
        info!("[subs] Loaded {} subscription(s)", stored.len());

        let subs = stored
            .into_iter()
            .map(|s| (s.subscription_id.clone(), s))
            .collect();
        Ok(Arc::new(Self {
            path,
            subs: RwLock::new(subs),
        }))
    }

    /// Insert or refresh the subscription for (deviceId, fcmToken).
    ///
    /// The lease is clamped to [1, 86400] seconds, defaulting to 3600.
    /// Returns the stored subscription and the accepted lease.
    pub async fn subscribe(
        &self,
        device_id: &str,
        cert_fingerprint: &str,
        fcm_token: &str,
        platform: PushPlatform,
        lease_seconds: Option<u64>,
    ) -> std::io::Result<(NoiseSubscription, u64)> {
        let lease = lease_seconds
            .unwrap_or(DEFAULT_LEASE_SECONDS)
            .clamp(1, MAX_LEASE_SECONDS);
        let now = epoch_sec();
        let sub = NoiseSubscription {
            device_id: device_id.to_owned(),
            cert_fingerprint: cert_fingerprint.to_owned(),
            fcm_token: fcm_token.to_owned(),
            platform,
            subscription_id: NoiseSubscription::subscription_id_for(device_id, fcm_token),
            created_at_epoch_sec: now,
            expires_at_epoch_sec: now + lease,
        };

        let mut subs = self.subs.write().await;
        let mut next = subs.clone();
        next.insert(sub.subscription_id.clone(), sub.clone());
        self.persist(&next).await?;
        *subs = next;
        debug!(
            "[subs] {} subscribed (lease {}s, id {})",
            device_id,
            lease,
            &sub.subscription_id[..16]
        );
        Ok((sub, lease))
    }

    /// Remove the caller's subscription identified by token or id.
    /// Only subscriptions owned by `device_id` are eligible. Idempotent:
    /// returns false when nothing matched.
    pub async fn unsubscribe(
        &self,
        device_id: &str,
        fcm_token: Option<&str>,
        subscription_id: Option<&str>,
    ) -> std::io::Result<bool> {
        let mut subs = self.subs.write().await;
        let target = subs
            .values()
            .find(|s| {
                s.device_id == device_id
                    && (fcm_token.is_some_and(|t| s.fcm_token == t)
                        || subscription_id.is_some_and(|id| s.subscription_id == id))
            })
            .map(|s| s.subscription_id.clone());

        let Some(id) = target else {
            return Ok(false);
        };
        let mut next = subs.clone();
        next.remove(&id);
        self.persist(&next).await?;
        *subs = next;
        debug!("[subs] {} unsubscribed ({})", device_id, &id[..16]);
        Ok(true)
    }

    /// All live (non-expired) subscriptions.
    pub async fn active(&self) -> Vec<NoiseSubscription> {
        let now = epoch_sec();
        self.subs
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired(now))
            .cloned()
            .collect()
    }

    pub async fn by_device(&self, device_id: &str) -> Vec<NoiseSubscription> {
        self.subs
            .read()
            .await
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn by_token(&self, fcm_token: &str) -> Option<NoiseSubscription> {
        self.subs
            .read()
            .await
            .values()
            .find(|s| s.fcm_token == fcm_token)
            .cloned()
    }

    pub async fn get(&self, subscription_id: &str) -> Option<NoiseSubscription> {
        self.subs.read().await.get(subscription_id).cloned()
    }

    /// Drop subscriptions whose tokens the push relay reported invalid.
    pub async fn remove_tokens(&self, tokens: &[String]) -> std::io::Result<usize> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let mut subs = self.subs.write().await;
        let mut next = subs.clone();
        let before = next.len();
        next.retain(|_, s| !tokens.contains(&s.fcm_token));
        let removed = before - next.len();
        if removed > 0 {
            self.persist(&next).await?;
            *subs = next;
            info!("[subs] Removed {} subscription(s) with invalid tokens", removed);
        }
        Ok(removed)
    }

    /// Evict expired entries; returns how many were removed.
    pub async fn sweep_expired(&self) -> std::io::Result<usize> {
        let now = epoch_sec();
        let mut subs = self.subs.write().await;
        let mut next = subs.clone();
        let before = next.len();
        next.retain(|_, s| !s.is_expired(now));
        let removed = before - next.len();
        if removed > 0 {
            self.persist(&next).await?;
            *subs = next;
            debug!("[subs] Swept {} expired subscription(s)", removed);
        }
        Ok(removed)
    }

    /// Background task sweeping expired entries every 60 s.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = registry.sweep_expired().await {
                    warn!("[subs] Sweep failed: {}", e);
                }
            }
        })
    }

    async fn persist(&self, subs: &HashMap<String, NoiseSubscription>) -> std::io::Result<()> {
        let mut list: Vec<&NoiseSubscription> = subs.values().collect();
        list.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        storage::write_json_atomic(&self.path, &list).await
    }
}
