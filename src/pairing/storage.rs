//! Persistence backends for pairing data
//!
//! The store only ever reads or replaces the whole device list, so a backend
//! needs nothing more than last-write-wins key/value semantics.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::PairedDevice;

const DEVICES_FILE_NAME: &str = "paired_devices.json";
const IDENTITY_FILE_NAME: &str = "device_id";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be (de)serialized
    #[error("stored data is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key/value persistence used by [`PairingStore`](super::PairingStore)
#[async_trait]
pub trait PairingPersistence: Send + Sync {
    /// Load the full paired-device list (empty when nothing is stored)
    async fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, StorageError>;

    /// Replace the stored list with `devices`
    async fn save_paired_devices(&self, devices: &[PairedDevice]) -> Result<(), StorageError>;

    /// Load the persisted local device identity
    async fn load_device_identity(&self) -> Result<Option<String>, StorageError>;

    /// Persist the local device identity
    async fn save_device_identity(&self, device_id: &str) -> Result<(), StorageError>;
}

/// JSON files in a private data directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn devices_path(&self) -> PathBuf {
        self.dir.join(DEVICES_FILE_NAME)
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE_NAME)
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&self.dir, perms).await?;
        }

        Ok(())
    }

    /// Write to a sibling temp file, then rename over the target
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let tmp_path = path.with_extension("tmp");
        // A leftover temp file would keep its old mode
        match tokio::fs::remove_file(&tmp_path).await {
            Ok(()) => debug!(path = %tmp_path.display(), "Removed stale temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Persisted pairing data");
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PairingPersistence for FilePersistence {
    async fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, StorageError> {
        match Self::read_optional(&self.devices_path()).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_paired_devices(&self, devices: &[PairedDevice]) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(devices)?;
        self.write_atomic(&self.devices_path(), &json).await
    }

    async fn load_device_identity(&self) -> Result<Option<String>, StorageError> {
        Ok(Self::read_optional(&self.identity_path())
            .await?
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    async fn save_device_identity(&self, device_id: &str) -> Result<(), StorageError> {
        self.write_atomic(&self.identity_path(), device_id.as_bytes())
            .await
    }
}

/// In-process persistence
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    devices: Mutex<Vec<PairedDevice>>,
    identity: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the stored identity
    pub fn with_identity(device_id: impl Into<String>) -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            identity: Mutex::new(Some(device_id.into())),
        }
    }
}

#[async_trait]
impl PairingPersistence for MemoryPersistence {
    async fn load_paired_devices(&self) -> Result<Vec<PairedDevice>, StorageError> {
        Ok(self.devices.lock().await.clone())
    }

    async fn save_paired_devices(&self, devices: &[PairedDevice]) -> Result<(), StorageError> {
        *self.devices.lock().await = devices.to_vec();
        Ok(())
    }

    async fn load_device_identity(&self) -> Result<Option<String>, StorageError> {
        Ok(self.identity.lock().await.clone())
    }

    async fn save_device_identity(&self, device_id: &str) -> Result<(), StorageError> {
        *self.identity.lock().await = Some(device_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedKey;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn device(remote: &str) -> PairedDevice {
        PairedDevice {
            id: format!("record-{}", remote),
            remote_device_id: remote.to_string(),
            name: "Laptop".to_string(),
            shared_key: SharedKey::from_bytes([3u8; 32]),
            date_added: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::new(temp_dir.path().join("data"));

        assert!(store.load_paired_devices().await.unwrap().is_empty());
        assert_eq!(store.load_device_identity().await.unwrap(), None);

        let devices = vec![device("a"), device("b")];
        store.save_paired_devices(&devices).await.unwrap();
        store.save_device_identity("me").await.unwrap();

        assert_eq!(store.load_paired_devices().await.unwrap(), devices);
        assert_eq!(store.load_device_identity().await.unwrap(), Some("me".to_string()));
    }

    #[tokio::test]
    async fn test_file_save_replaces_whole_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::new(temp_dir.path());

        store.save_paired_devices(&[device("a"), device("b")]).await.unwrap();
        store.save_paired_devices(&[device("c")]).await.unwrap();

        let loaded = store.load_paired_devices().await.unwrap();
        assert_eq!(loaded, vec![device("c")]);
        assert!(!temp_dir.path().join("paired_devices.tmp").exists());
    }

    #[tokio::test]
    async fn test_keys_stored_as_hex() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::new(temp_dir.path());
        store.save_paired_devices(&[device("a")]).await.unwrap();

        let raw = std::fs::read_to_string(temp_dir.path().join(DEVICES_FILE_NAME)).unwrap();
        assert!(raw.contains(&"03".repeat(32)));
        assert!(raw.contains("remoteDeviceId"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(DEVICES_FILE_NAME), "{oops").unwrap();

        let store = FilePersistence::new(temp_dir.path());
        assert!(matches!(
            store.load_paired_devices().await,
            Err(StorageError::Json(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = FilePersistence::new(temp_dir.path().join("private"));
        store.save_device_identity("me").await.unwrap();

        let mode = std::fs::metadata(temp_dir.path().join("private").join(IDENTITY_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_temp_file_mode_not_inherited() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let tmp_path = temp_dir.path().join("paired_devices.tmp");
        std::fs::write(&tmp_path, b"stale").unwrap();
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let store = FilePersistence::new(temp_dir.path());
        store.save_paired_devices(&[device("a")]).await.unwrap();

        let mode = std::fs::metadata(temp_dir.path().join(DEVICES_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!tmp_path.exists());
        assert_eq!(store.load_paired_devices().await.unwrap(), vec![device("a")]);
    }

    #[tokio::test]
    async fn test_memory_persistence() {
        let store = MemoryPersistence::with_identity("seeded");
        assert_eq!(store.load_device_identity().await.unwrap(), Some("seeded".to_string()));

        store.save_paired_devices(&[device("x")]).await.unwrap();
        assert_eq!(store.load_paired_devices().await.unwrap().len(), 1);
    }
}
