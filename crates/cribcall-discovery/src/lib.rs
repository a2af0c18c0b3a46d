//! mDNS discovery: monitors advertise, listeners browse.
//!
//! Service type `_baby-monitor._tcp.local.` with the control-plane record
//! schema in TXT keys. Browsing yields resolved [`MdnsAdvertisement`] values
//! over a channel.

pub mod advertiser;

use cribcall_core::types::MdnsAdvertisement;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, info};

pub use advertiser::MonitorAdvertiser;

pub const SERVICE_TYPE: &str = "_baby-monitor._tcp.local.";

/// Browses for monitors on the local network.
pub struct DiscoveryService {
    daemon: Option<ServiceDaemon>,
}

impl DiscoveryService {
    pub fn new() -> Self {
        Self { daemon: None }
    }

    /// Start browsing; resolved monitors arrive on the returned channel.
    pub fn start_browsing(
        &mut self,
    ) -> Result<tokio::sync::mpsc::Receiver<MdnsAdvertisement>, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(ip) = info.get_addresses().iter().next() else {
                            continue;
                        };
                        let txt = |key: &str| {
                            info.get_property_val_str(key).map(str::to_owned).unwrap_or_default()
                        };
                        let advertisement = MdnsAdvertisement {
                            remote_device_id: txt("monitorId"),
                            monitor_name: txt("monitorName"),
                            cert_fingerprint: txt("monitorCertFingerprint"),
                            control_port: txt("controlPort").parse().unwrap_or(info.get_port()),
                            pairing_port: txt("pairingPort").parse().unwrap_or_default(),
                            version: txt("version").parse().unwrap_or_default(),
                            transport: txt("transport"),
                            ip: ip.to_string(),
                        };
                        if advertisement.remote_device_id.is_empty() {
                            debug!(
                                "[mDNS] Ignoring instance without monitorId: {}",
                                info.get_fullname()
                            );
                            continue;
                        }
                        info!(
                            "[mDNS] Found monitor '{}' at {}",
                            advertisement.monitor_name,
                            advertisement.control_addr()
                        );
                        let _ = tx.send(advertisement).await;
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("[mDNS] Monitor gone: {}", fullname);
                    }
                    _ => {}
                }
            }
        });

        self.daemon = Some(daemon);
        Ok(rx)
    }

    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown();
        }
    }
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect the primary LAN IPv4 address by probing an external socket.
///
/// No packets are actually sent — this just queries the OS routing table.
pub fn detect_local_ip() -> std::net::IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)))
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed to start: {0}")]
    DaemonFailed(String),

    #[error("failed to browse service: {0}")]
    BrowseFailed(String),

    #[error("failed to register service: {0}")]
    RegisterFailed(String),
}
