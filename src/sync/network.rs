//! Content-addressed sync network
//!
//! Objects are stored under the SHA-256 of their bytes. Each device keeps a
//! single head pointing at its latest signed manifest.

use super::manifest::SignedManifest;
use crate::blob::ContentHash;
use crate::error::{Error, Result};
use crate::persist;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared network between a vault owner's devices
#[async_trait]
pub trait SyncNetwork: Send + Sync {
    /// Store bytes, returning their content address
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash>;

    /// Fetch the bytes stored at `address`. Callers verify the result.
    async fn fetch(&self, address: &ContentHash) -> Result<Vec<u8>>;

    /// Replace this device's head with `manifest`
    async fn publish(&self, manifest: &SignedManifest) -> Result<()>;

    /// Latest manifest of every device
    async fn manifests(&self) -> Result<Vec<SignedManifest>>;
}

/// Device ids end up in file names
fn check_device_id(device_id: &str) -> Result<()> {
    let valid = !device_id.is_empty()
        && device_id.len() <= 64
        && device_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(Error::Validation(format!("Invalid device id: {}", device_id)));
    }
    Ok(())
}

/// A shared directory (network mount, synced folder) used as the network.
///
/// ```text
/// <dir>/objects/<hh>/<address>
/// <dir>/heads/<device-id>.json
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryNetwork {
    root: PathBuf,
}

impl DirectoryNetwork {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, address: &ContentHash) -> PathBuf {
        self.root.join("objects").join(address.prefix()).join(address.as_str())
    }

    fn head_path(&self, device_id: &str) -> PathBuf {
        self.root.join("heads").join(format!("{}.json", device_id))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = persist::temp_path(path);
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn network_error(what: &str, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(what.to_string()),
        _ => Error::Network(format!("{}: {}", what, err)),
    }
}

#[async_trait]
impl SyncNetwork for DirectoryNetwork {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash> {
        let address = ContentHash::of(&bytes);
        let path = self.object_path(&address);
        // Write-once: an existing object already has these bytes
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(address);
        }
        Self::write_atomic(&path, &bytes)
            .await
            .map_err(|e| Error::Network(format!("Failed to store object {}: {}", address.short(), e)))?;
        Ok(address)
    }

    async fn fetch(&self, address: &ContentHash) -> Result<Vec<u8>> {
        tokio::fs::read(self.object_path(address))
            .await
            .map_err(|e| network_error(&format!("Object {}", address), e))
    }

    async fn publish(&self, manifest: &SignedManifest) -> Result<()> {
        check_device_id(&manifest.device_id)?;
        let bytes = manifest.to_bytes()?;
        Self::write_atomic(&self.head_path(&manifest.device_id), &bytes)
            .await
            .map_err(|e| Error::Network(format!("Failed to publish manifest: {}", e)))
    }

    async fn manifests(&self) -> Result<Vec<SignedManifest>> {
        let heads = self.root.join("heads");
        let mut entries = match tokio::fs::read_dir(&heads).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(network_error("Manifest heads", e)),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| network_error("Manifest heads", e))?
        {
            let path = entry.path();
            if persist::is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| network_error("Manifest head", e))?;
            // One unreadable head must not stop sync with every other device
            match SignedManifest::from_bytes(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable manifest: {}", e),
            }
        }
        Ok(manifests)
    }
}

#[derive(Debug, Default)]
struct MemoryNetworkInner {
    objects: Mutex<HashMap<ContentHash, Vec<u8>>>,
    heads: Mutex<HashMap<String, SignedManifest>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

/// In-process network for tests and single-machine setups, with switches
/// to simulate an outage or a slow link
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Overwrite stored bytes in place, bypassing content addressing
    pub fn tamper(&self, address: &ContentHash, bytes: Vec<u8>) {
        self.inner
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address.clone(), bytes);
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("Network unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncNetwork for MemoryNetwork {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash> {
        self.gate().await?;
        let address = ContentHash::of(&bytes);
        self.inner
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(address.clone())
            .or_insert(bytes);
        Ok(address)
    }

    async fn fetch(&self, address: &ContentHash) -> Result<Vec<u8>> {
        self.gate().await?;
        self.inner
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Object {}", address)))
    }

    async fn publish(&self, manifest: &SignedManifest) -> Result<()> {
        self.gate().await?;
        check_device_id(&manifest.device_id)?;
        self.inner
            .heads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(manifest.device_id.clone(), manifest.clone());
        Ok(())
    }

    async fn manifests(&self) -> Result<Vec<SignedManifest>> {
        self.gate().await?;
        Ok(self
            .inner
            .heads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(device_id: &str, sequence: u64) -> SignedManifest {
        SignedManifest {
            device_id: device_id.to_string(),
            sequence,
            verifying_key: vec![1; 32],
            payload: vec![2; 40],
            signature: vec![3; 64],
        }
    }

    #[tokio::test]
    async fn test_directory_put_fetch() {
        let dir = TempDir::new().unwrap();
        let network = DirectoryNetwork::new(dir.path());

        let address = network.put(b"object".to_vec()).await.unwrap();
        assert_eq!(address, ContentHash::of(b"object"));
        assert_eq!(network.put(b"object".to_vec()).await.unwrap(), address);
        assert_eq!(network.fetch(&address).await.unwrap(), b"object");

        let missing = ContentHash::of(b"missing");
        assert!(matches!(network.fetch(&missing).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_directory_heads() {
        let dir = TempDir::new().unwrap();
        let network = DirectoryNetwork::new(dir.path());
        assert!(network.manifests().await.unwrap().is_empty());

        network.publish(&manifest("dev-a", 1)).await.unwrap();
        network.publish(&manifest("dev-a", 2)).await.unwrap();
        network.publish(&manifest("dev-b", 1)).await.unwrap();
        std::fs::write(dir.path().join("heads").join("broken.json"), "{").unwrap();

        let mut heads = network.manifests().await.unwrap();
        heads.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_device_id() {
        let dir = TempDir::new().unwrap();
        let network = DirectoryNetwork::new(dir.path());
        let result = network.publish(&manifest("../escape", 1)).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_memory_network_offline() {
        let network = MemoryNetwork::new();
        let address = network.put(b"x".to_vec()).await.unwrap();

        network.set_offline(true);
        assert!(matches!(network.fetch(&address).await, Err(Error::Network(_))));

        network.set_offline(false);
        assert_eq!(network.fetch(&address).await.unwrap(), b"x");
        assert_eq!(network.object_count(), 1);
    }
}
