//! Persistent trusted-peer store.
//!
//! One JSON-array file per role (`trusted_listeners.json` on the monitor,
//! `trusted_monitors.json` on a listener). Writes replace the whole file
//! atomically and are serialised by a per-store mutex; a lock-free snapshot
//! keyed by fingerprint serves the TLS verifiers, which run in sync context
//! inside the rustls handshake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::info;

use cribcall_core::types::{DeviceRole, TrustedPeer};

pub struct TrustStore {
    role: DeviceRole,
    path: PathBuf,
    /// Serialises mutations (and their file writes).
    peers: Mutex<Vec<TrustedPeer>>,
    /// Latest committed state, keyed by certificate fingerprint.
    snapshot: Arc<RwLock<HashMap<String, TrustedPeer>>>,
}

impl TrustStore {
    /// Open (or create empty) the trust store for `role` under `dir`.
    pub async fn open(dir: &std::path::Path, role: DeviceRole) -> std::io::Result<Arc<Self>> {
        let path = dir.join(role.trust_file());
        let peers: Vec<TrustedPeer> = cribcall_core::storage::read_json(&path)
            .await?
            .unwrap_or_default();
        info!("[trust] Loaded {} {} peer(s)", peers.len(), role);

        let snapshot = Arc::new(RwLock::new(index_by_fingerprint(&peers)));
        Ok(Arc::new(Self {
            role,
            path,
            peers: Mutex::new(peers),
            snapshot,
        }))
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Handle to the committed-state snapshot, shared with TLS verifiers.
    pub fn snapshot(&self) -> Arc<RwLock<HashMap<String, TrustedPeer>>> {
        Arc::clone(&self.snapshot)
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub async fn list(&self) -> Vec<TrustedPeer> {
        self.peers.lock().await.clone()
    }

    /// Snapshot lookup; observes the latest committed write.
    pub fn lookup_by_fingerprint(&self, fingerprint: &str) -> Option<TrustedPeer> {
        self.snapshot
            .read()
            .expect("trust snapshot lock poisoned")
            .get(fingerprint)
            .cloned()
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.snapshot
            .read()
            .expect("trust snapshot lock poisoned")
            .contains_key(fingerprint)
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Insert or replace the peer with the same fingerprint.
    pub async fn upsert(&self, peer: TrustedPeer) -> std::io::Result<()> {
        let mut peers = self.peers.lock().await;
        let mut next = peers.clone();
        next.retain(|p| p.cert_fingerprint != peer.cert_fingerprint);
        next.push(peer);
        self.commit(&mut peers, next).await
    }

    pub async fn remove_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> std::io::Result<Option<TrustedPeer>> {
        let mut peers = self.peers.lock().await;
        let removed = peers.iter().find(|p| p.cert_fingerprint == fingerprint).cloned();
        if removed.is_none() {
            return Ok(None);
        }
        let next: Vec<_> = peers
            .iter()
            .filter(|p| p.cert_fingerprint != fingerprint)
            .cloned()
            .collect();
        self.commit(&mut peers, next).await?;
        Ok(removed)
    }

    pub async fn remove_by_device_id(
        &self,
        device_id: &str,
    ) -> std::io::Result<Option<TrustedPeer>> {
        let mut peers = self.peers.lock().await;
        let removed = peers.iter().find(|p| p.remote_device_id == device_id).cloned();
        if removed.is_none() {
            return Ok(None);
        }
        let next: Vec<_> = peers
            .iter()
            .filter(|p| p.remote_device_id != device_id)
            .cloned()
            .collect();
        self.commit(&mut peers, next).await?;
        Ok(removed)
    }

    /// Record where a peer was last reached (listener side).
    pub async fn update_last_known_ip(&self, fingerprint: &str, ip: &str) -> std::io::Result<()> {
        let mut peers = self.peers.lock().await;
        let mut next = peers.clone();
        let Some(peer) = next.iter_mut().find(|p| p.cert_fingerprint == fingerprint) else {
            return Ok(());
        };
        peer.last_known_ip = Some(ip.to_owned());
        self.commit(&mut peers, next).await
    }

    /// Record the latest noise event observed from a peer (listener side).
    pub async fn update_last_noise(
        &self,
        fingerprint: &str,
        epoch_ms: u64,
    ) -> std::io::Result<()> {
        let mut peers = self.peers.lock().await;
        let mut next = peers.clone();
        let Some(peer) = next.iter_mut().find(|p| p.cert_fingerprint == fingerprint) else {
            return Ok(());
        };
        peer.last_noise_epoch_ms = Some(epoch_ms);
        self.commit(&mut peers, next).await
    }

    /// Persist `next`, then commit it to memory and the snapshot. A failed
    /// write leaves both unchanged.
    async fn commit(
        &self,
        peers: &mut Vec<TrustedPeer>,
        next: Vec<TrustedPeer>,
    ) -> std::io::Result<()> {
        cribcall_core::storage::write_json_atomic(&self.path, &next).await?;
        *self
            .snapshot
            .write()
            .expect("trust snapshot lock poisoned") = index_by_fingerprint(&next);
        *peers = next;
        Ok(())
    }
}

fn index_by_fingerprint(peers: &[TrustedPeer]) -> HashMap<String, TrustedPeer> {
    peers
        .iter()
        .map(|p| (p.cert_fingerprint.clone(), p.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, fp: &str) -> TrustedPeer {
        let der: &[u8] = &[0x30, 0x03, 0x01, 0x01, 0x00];
        TrustedPeer::new(id, format!("Peer {id}"), fp, Some(der))
    }

    #[tokio::test]
    async fn upsert_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path(), DeviceRole::Monitor).await.unwrap();

        store.upsert(peer("a", "fp-a")).await.unwrap();
        store.upsert(peer("b", "fp-b")).await.unwrap();
        assert_eq!(store.list().await.len(), 2);
        assert!(store.contains_fingerprint("fp-a"));

        let removed = store.remove_by_fingerprint("fp-a").await.unwrap();
        assert_eq!(removed.unwrap().remote_device_id, "a");
        assert!(!store.contains_fingerprint("fp-a"));
        assert!(store.remove_by_fingerprint("fp-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_same_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path(), DeviceRole::Monitor).await.unwrap();

        store.upsert(peer("old-id", "fp")).await.unwrap();
        store.upsert(peer("new-id", "fp")).await.unwrap();

        let peers = store.list().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].remote_device_id, "new-id");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TrustStore::open(dir.path(), DeviceRole::Listener).await.unwrap();
            store.upsert(peer("m", "fp-m")).await.unwrap();
        }
        let store = TrustStore::open(dir.path(), DeviceRole::Listener).await.unwrap();
        let found = store.lookup_by_fingerprint("fp-m").unwrap();
        assert_eq!(found.remote_device_id, "m");
    }

    #[tokio::test]
    async fn remove_by_device_id_removes_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path(), DeviceRole::Monitor).await.unwrap();
        store.upsert(peer("a", "fp-a")).await.unwrap();
        store.upsert(peer("b", "fp-b")).await.unwrap();

        let removed = store.remove_by_device_id("b").await.unwrap();
        assert_eq!(removed.unwrap().cert_fingerprint, "fp-b");
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_tracks_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path(), DeviceRole::Monitor).await.unwrap();
        let snapshot = store.snapshot();

        store.upsert(peer("a", "fp-a")).await.unwrap();
        assert!(snapshot.read().unwrap().contains_key("fp-a"));

        store.remove_by_fingerprint("fp-a").await.unwrap();
        assert!(snapshot.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_last_noise_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path(), DeviceRole::Listener).await.unwrap();
        store.upsert(peer("m", "fp-m")).await.unwrap();
        store.update_last_noise("fp-m", 1234).await.unwrap();

        let found = store.lookup_by_fingerprint("fp-m").unwrap();
        assert_eq!(found.last_noise_epoch_ms, Some(1234));
    }
}
