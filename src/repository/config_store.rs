//! JSON file store for proxy descriptors and the selected interface
//!
//! The whole document is rewritten on every change through a temp file and a
//! rename, so a crash never leaves a half-written file behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SnapError};
use crate::models::{InstanceSpec, NetworkInterfaceDescriptor};

/// Persistence of proxy descriptors and the selected network interface
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Every stored descriptor, in stored order
    async fn load_all(&self) -> Result<Vec<InstanceSpec>>;

    /// Append descriptors, assigning ids after the highest stored one.
    /// Returns the descriptors as stored.
    async fn append(&self, specs: Vec<InstanceSpec>) -> Result<Vec<InstanceSpec>>;

    /// Delete one descriptor; returns whether it existed
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Delete every descriptor; returns how many were stored
    async fn delete_all(&self) -> Result<usize>;

    async fn network(&self) -> Result<Option<NetworkInterfaceDescriptor>>;

    async fn set_network(&self, descriptor: NetworkInterfaceDescriptor) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredState {
    #[serde(default)]
    proxies: Vec<InstanceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_interface: Option<NetworkInterfaceDescriptor>,
}

/// Config store backed by one pretty-printed JSON file
pub struct JsonConfigStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file reads as empty
    async fn read(&self) -> StoredState {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoredState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read config file");
                return StoredState::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Config file is not valid, treating as empty");
            StoredState::default()
        })
    }

    async fn write(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SnapError::Storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let body = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| SnapError::Storage(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SnapError::Storage(format!("cannot replace {}: {}", self.path.display(), e)))?;

        debug!(path = %self.path.display(), proxies = state.proxies.len(), "Config file written");
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn load_all(&self) -> Result<Vec<InstanceSpec>> {
        Ok(self.read().await.proxies)
    }

    async fn append(&self, specs: Vec<InstanceSpec>) -> Result<Vec<InstanceSpec>> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await;

        let next = state.proxies.iter().map(|p| p.id).max().unwrap_or(-1) + 1;
        let appended: Vec<InstanceSpec> = specs
            .into_iter()
            .zip(next..)
            .map(|(mut spec, id)| {
                spec.id = id;
                spec
            })
            .collect();

        state.proxies.extend(appended.iter().cloned());
        self.write(&state).await?;

        info!(count = appended.len(), total = state.proxies.len(), "Proxy configs stored");
        Ok(appended)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await;

        let before = state.proxies.len();
        state.proxies.retain(|p| p.id != id);
        if state.proxies.len() == before {
            return Ok(false);
        }

        self.write(&state).await?;
        Ok(true)
    }

    async fn delete_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await;

        let removed = std::mem::take(&mut state.proxies).len();
        self.write(&state).await?;
        info!(removed, "Proxy configs cleared");
        Ok(removed)
    }

    async fn network(&self) -> Result<Option<NetworkInterfaceDescriptor>> {
        Ok(self.read().await.network_interface)
    }

    async fn set_network(&self, descriptor: NetworkInterfaceDescriptor) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read().await;
        state.network_interface = Some(descriptor);
        self.write(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyKind;
    use tokio_test::{assert_err, assert_ok};

    fn spec(id: i64, port: u16) -> InstanceSpec {
        InstanceSpec {
            id,
            kind: ProxyKind::Socks5,
            listen_port: port,
            bound_address: format!("2001:db8::{:x}", port).parse().unwrap(),
            interface_name: "eth0".into(),
            prefix_length: 64,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::new(dir.path().join("absent.json"));

        assert!(store.load_all().await.unwrap().is_empty());
        assert!(store.network().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonConfigStore::new(&path);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_reassigns_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::new(dir.path().join("nested/dir/proxy-config.json"));

        let first = store.append(vec![spec(7, 10000), spec(7, 10001)]).await.unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![0, 1]);

        let second = store.append(vec![spec(0, 10002)]).await.unwrap();
        assert_eq!(second[0].id, 2);

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].listen_port, 10002);
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::new(dir.path().join("proxy-config.json"));
        store
            .append(vec![spec(0, 10000), spec(0, 10001), spec(0, 10002)])
            .await
            .unwrap();

        assert!(store.delete(1).await.unwrap());
        assert!(!store.delete(1).await.unwrap());
        let ids: Vec<_> = store.load_all().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 2]);

        // Ids continue after the highest remaining one
        assert_eq!(store.append(vec![spec(0, 10003)]).await.unwrap()[0].id, 3);

        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_survives_proxy_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-config.json");
        let store = JsonConfigStore::new(&path);

        let descriptor = NetworkInterfaceDescriptor::from_interface_address(
            "eth0",
            "2001:db8:1::5".parse().unwrap(),
            64,
        );
        assert_ok!(store.set_network(descriptor.clone()).await);
        assert_ok!(store.append(vec![spec(0, 10000)]).await);
        assert_ok!(store.delete_all().await);

        assert_eq!(store.network().await.unwrap(), Some(descriptor));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"networkInterface\""));
        assert!(raw.contains("\"proxies\": []"));
    }

    #[tokio::test]
    async fn test_reads_legacy_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-config.json");
        std::fs::write(
            &path,
            r#"{"proxies":[{"id":4,"type":"HTTP","port":10004,"ipv6":"2001:db8::4","interfaceName":"eth0","prefix":64}]}"#,
        )
        .unwrap();

        let stored = JsonConfigStore::new(&path).load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].listen_port, 10004);
        assert_eq!(stored[0].kind, ProxyKind::Http);
    }

    #[tokio::test]
    async fn test_write_failure_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let store = JsonConfigStore::new(blocker.join("proxy-config.json"));
        let err = assert_err!(store.append(vec![spec(0, 10000)]).await);
        assert!(matches!(err, SnapError::Storage(_)));
    }
}
