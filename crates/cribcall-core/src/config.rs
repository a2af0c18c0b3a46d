use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage;
use crate::types::DeviceRole;

/// Sound detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NoiseSettings {
    /// Level threshold on the 0..100 scale.
    pub threshold: f32,
    /// Sound must stay above threshold for at least this long.
    #[serde(alias = "minDurationMS")]
    pub min_duration_ms: u64,
    /// Minimum gap between emitted events.
    pub cooldown_seconds: u64,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            threshold: 50.0,
            min_duration_ms: 300,
            cooldown_seconds: 30,
        }
    }
}

/// Monitor-role settings (`monitor_settings.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorSettings {
    pub device_name: Option<String>,
    pub noise: NoiseSettings,
    /// HTTPS endpoint of the push relay; pushes are skipped when unset.
    pub push_relay_url: Option<String>,
    /// Listener webhook endpoints keyed by certificate fingerprint.
    pub listener_webhooks: HashMap<String, String>,
}

/// Listener-role settings (`listener_settings.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerSettings {
    pub device_name: Option<String>,
    pub fcm_token: Option<String>,
    pub notifications_enabled: bool,
}

/// Cross-role session state (`app_session.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSession {
    pub last_role: Option<DeviceRole>,
    pub monitoring_enabled: bool,
    pub device_name: Option<String>,
}

impl MonitorSettings {
    pub async fn load(dir: &Path) -> std::io::Result<Self> {
        Ok(storage::read_json(&dir.join(storage::MONITOR_SETTINGS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn store(&self, dir: &Path) -> std::io::Result<()> {
        storage::write_json_atomic(&dir.join(storage::MONITOR_SETTINGS_FILE), self).await
    }
}

impl ListenerSettings {
    pub async fn load(dir: &Path) -> std::io::Result<Self> {
        Ok(storage::read_json(&dir.join(storage::LISTENER_SETTINGS_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn store(&self, dir: &Path) -> std::io::Result<()> {
        storage::write_json_atomic(&dir.join(storage::LISTENER_SETTINGS_FILE), self).await
    }
}

impl AppSession {
    pub async fn load(dir: &Path) -> std::io::Result<Self> {
        Ok(storage::read_json(&dir.join(storage::APP_SESSION_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn store(&self, dir: &Path) -> std::io::Result<()> {
        storage::write_json_atomic(&dir.join(storage::APP_SESSION_FILE), self).await
    }
}
