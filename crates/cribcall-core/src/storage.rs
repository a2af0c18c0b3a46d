//! Role-specific data directory layout and crash-safe JSON persistence.
//!
//! Every persisted file is rewritten whole: serialise to a sibling temp file,
//! then rename over the target. A crash mid-write leaves either the old file
//! or the new file, never a partial one.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const IDENTITY_FILE: &str = "identity.json";
pub const NOISE_SUBSCRIPTIONS_FILE: &str = "noise_subscriptions.json";
pub const MONITOR_SETTINGS_FILE: &str = "monitor_settings.json";
pub const LISTENER_SETTINGS_FILE: &str = "listener_settings.json";
pub const APP_SESSION_FILE: &str = "app_session.json";

/// Write `value` as pretty JSON to `path`, atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read and parse `path`; `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "file".into());
    name.push(".tmp");
    path.with_file_name(name)
}
