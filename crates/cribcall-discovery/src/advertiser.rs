//! mDNS service advertisement for the monitor.
//!
//! # TXT record keys
//!
//! | Key                      | Value                                  |
//! |--------------------------|----------------------------------------|
//! | `monitorId`              | Stable device id                       |
//! | `monitorName`            | Human-readable monitor name            |
//! | `monitorCertFingerprint` | Hex SHA-256 of the identity cert       |
//! | `version`                | Protocol version (`"1"`)               |
//! | `transport`              | `"http-ws"`                            |
//! | `controlPort`            | mTLS control port                      |
//! | `pairingPort`            | TLS pairing port                       |

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

use cribcall_core::types::{PROTOCOL_VERSION, TRANSPORT};

use crate::{DiscoveryError, SERVICE_TYPE};

/// Active mDNS advertisement. Call [`unregister`](Self::unregister) on
/// shutdown.
pub struct MonitorAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MonitorAdvertiser {
    pub fn register(
        monitor_id: &str,
        monitor_name: &str,
        cert_fingerprint: &str,
        control_port: u16,
        pairing_port: u16,
        host_ip: IpAddr,
    ) -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;

        let raw_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "cribcall-monitor".to_owned());
        let host = format!("{raw_host}.local.");

        let mut properties = HashMap::new();
        properties.insert("monitorId".to_owned(), monitor_id.to_owned());
        properties.insert("monitorName".to_owned(), monitor_name.to_owned());
        properties.insert(
            "monitorCertFingerprint".to_owned(),
            cert_fingerprint.to_owned(),
        );
        properties.insert("version".to_owned(), PROTOCOL_VERSION.to_string());
        properties.insert("transport".to_owned(), TRANSPORT.to_owned());
        properties.insert("controlPort".to_owned(), control_port.to_string());
        properties.insert("pairingPort".to_owned(), pairing_port.to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            monitor_name,
            &host,
            host_ip,
            control_port,
            Some(properties),
        )
        .map_err(|e| DiscoveryError::RegisterFailed(e.to_string()))?;

        let fullname = service.get_fullname().to_owned();
        daemon
            .register(service)
            .map_err(|e| DiscoveryError::RegisterFailed(e.to_string()))?;

        info!(
            "[mDNS] Advertising '{}' at {} (control {}, pairing {})",
            monitor_name, host_ip, control_port, pairing_port
        );
        Ok(Self { daemon, fullname })
    }

    pub fn unregister(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("[mDNS] Failed to unregister '{}': {}", self.fullname, e);
        } else {
            info!("[mDNS] Advertisement '{}' removed.", self.fullname);
        }
    }
}
