//! Device identity and the set of paired devices
//!
//! A pairing code has the form `remoteDeviceId|tag|keyHex`. The key is used
//! as the AES-256 key directly, so the device that generates the code must
//! draw it from a CSPRNG.

pub mod storage;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{CryptoError, SharedKey, KEY_LEN};
use crate::transport::protocol::now_millis;

pub use storage::{FilePersistence, MemoryPersistence, PairingPersistence, StorageError};

/// Separator between pairing code fields
pub const PAIRING_CODE_SEPARATOR: char = '|';

/// Name given to devices paired without an explicit name
pub const DEFAULT_DEVICE_NAME: &str = "Remote Device";

/// Pairing errors, phrased for the operator
#[derive(Debug, Error)]
pub enum PairingError {
    /// Wrong number of fields or empty device id
    #[error("Invalid pairing code format: expected deviceId|tag|key")]
    InvalidFormat,

    /// The code names this device
    #[error("Cannot pair device with itself")]
    SelfPairing,

    /// The remote device is already in the paired set
    #[error("Device {0} is already paired")]
    AlreadyPaired(String),

    /// Key field is not 64 hex characters
    #[error("Invalid pairing key: {0}")]
    InvalidKey(String),

    /// No paired device has this record id
    #[error("No paired device with id {0}")]
    NotFound(String),

    /// The persistence backend failed
    #[error("Failed to persist pairing data: {0}")]
    Storage(#[from] StorageError),
}

/// A device this one is allowed to exchange clipboard content with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Local record id
    pub id: String,

    /// Identity the remote device uses in its envelopes
    pub remote_device_id: String,

    /// Display name
    pub name: String,

    /// AES-256 key shared with the remote device
    pub shared_key: SharedKey,

    /// When the pairing was made, epoch milliseconds
    pub date_added: i64,
}

/// Split `remoteDeviceId|tag|keyHex` into its fields
fn split_code(code: &str) -> Result<(&str, &str, &str), PairingError> {
    let fields: Vec<&str> = code.trim().split(PAIRING_CODE_SEPARATOR).collect();
    match fields.as_slice() {
        [remote_device_id, tag, key_hex] if !remote_device_id.is_empty() => {
            Ok((*remote_device_id, *tag, *key_hex))
        }
        _ => Err(PairingError::InvalidFormat),
    }
}

fn parse_key(key_hex: &str) -> Result<SharedKey, PairingError> {
    if key_hex.len() != KEY_LEN * 2 {
        return Err(PairingError::InvalidKey(format!(
            "expected {} hex characters, got {}",
            KEY_LEN * 2,
            key_hex.len()
        )));
    }
    SharedKey::from_hex(key_hex).map_err(|e| match e {
        CryptoError::InvalidKey(reason) => PairingError::InvalidKey(reason),
        other => PairingError::InvalidKey(other.to_string()),
    })
}

/// Local identity plus the paired-device set, backed by a persistence layer
pub struct PairingStore {
    persistence: Arc<dyn PairingPersistence>,
    devices: RwLock<Vec<PairedDevice>>,
    device_id: OnceCell<String>,
}

impl PairingStore {
    /// Open the store, loading the persisted device set
    pub async fn open(persistence: Arc<dyn PairingPersistence>) -> Result<Self, PairingError> {
        let devices = persistence.load_paired_devices().await?;
        debug!(count = devices.len(), "Loaded paired devices");

        Ok(Self {
            persistence,
            devices: RwLock::new(devices),
            device_id: OnceCell::new(),
        })
    }

    /// This device's identity, generated and persisted on first access
    pub async fn device_id(&self) -> Result<String, PairingError> {
        let id = self
            .device_id
            .get_or_try_init(|| async {
                if let Some(existing) = self.persistence.load_device_identity().await? {
                    return Ok::<_, PairingError>(existing);
                }
                let generated = Uuid::new_v4().to_string();
                self.persistence.save_device_identity(&generated).await?;
                info!(device_id = %generated, "Generated new device identity");
                Ok(generated)
            })
            .await?;
        Ok(id.clone())
    }

    /// Pair using `code` with the default display name
    pub async fn add_paired_device(&self, code: &str) -> Result<PairedDevice, PairingError> {
        self.add_paired_device_with_name(code, DEFAULT_DEVICE_NAME)
            .await
    }

    /// Pair using `code`, naming the device `name`
    pub async fn add_paired_device_with_name(
        &self,
        code: &str,
        name: &str,
    ) -> Result<PairedDevice, PairingError> {
        let (remote_device_id, _tag, key_hex) = split_code(code).inspect_err(|_| {
            warn!("Rejected malformed pairing code");
        })?;

        if remote_device_id == self.device_id().await? {
            warn!("Rejected pairing code: self-pairing");
            return Err(PairingError::SelfPairing);
        }

        let mut devices = self.devices.write().await;
        if devices
            .iter()
            .any(|d| d.remote_device_id == remote_device_id)
        {
            return Err(PairingError::AlreadyPaired(remote_device_id.to_string()));
        }

        let shared_key = parse_key(key_hex)?;
        let device = PairedDevice {
            id: Uuid::new_v4().to_string(),
            remote_device_id: remote_device_id.to_string(),
            name: name.to_string(),
            shared_key,
            date_added: now_millis(),
        };

        devices.push(device.clone());
        if let Err(e) = self.persistence.save_paired_devices(&devices).await {
            devices.pop();
            return Err(e.into());
        }

        info!(
            remote_device_id = %device.remote_device_id,
            key = %device.shared_key.fingerprint(),
            "Device paired"
        );
        Ok(device)
    }

    /// Remove the record with local id `id`
    pub async fn remove_paired_device(&self, id: &str) -> Result<PairedDevice, PairingError> {
        let mut devices = self.devices.write().await;
        let index = devices
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| PairingError::NotFound(id.to_string()))?;

        let removed = devices.remove(index);
        if let Err(e) = self.persistence.save_paired_devices(&devices).await {
            devices.insert(index, removed);
            return Err(e.into());
        }

        info!(remote_device_id = %removed.remote_device_id, "Device removed");
        Ok(removed)
    }

    /// Key shared with `remote_device_id`, if paired
    pub async fn resolve_key(&self, remote_device_id: &str) -> Option<SharedKey> {
        self.find_by_remote_id(remote_device_id)
            .await
            .map(|d| d.shared_key)
    }

    pub async fn find_by_remote_id(&self, remote_device_id: &str) -> Option<PairedDevice> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.remote_device_id == remote_device_id)
            .cloned()
    }

    /// Snapshot of all paired devices
    pub async fn paired_devices(&self) -> Vec<PairedDevice> {
        self.devices.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hex() -> String {
        "0f".repeat(32)
    }

    async fn store_for(device_id: &str) -> (PairingStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::with_identity(device_id));
        let store = PairingStore::open(persistence.clone()).await.unwrap();
        (store, persistence)
    }

    #[test]
    fn test_split_code() {
        let hex = key_hex();
        let code = format!("  mac-1|1712345678|{}\n", hex);
        assert_eq!(
            split_code(&code).unwrap(),
            ("mac-1", "1712345678", hex.as_str())
        );
        assert!(matches!(
            split_code("|1|abc"),
            Err(PairingError::InvalidFormat)
        ));
    }

    #[tokio::test]
    async fn test_wrong_field_count() {
        let (store, _) = store_for("abc").await;
        for code in ["", "only-one", "a|b", "a|b|c|d"] {
            assert!(matches!(
                store.add_paired_device(code).await,
                Err(PairingError::InvalidFormat)
            ));
        }
    }

    #[tokio::test]
    async fn test_self_pairing_rejected() {
        let (store, _) = store_for("abc").await;
        let result = store.add_paired_device(&format!("abc|1|{}", key_hex())).await;
        assert!(matches!(result, Err(PairingError::SelfPairing)));
        assert!(store.paired_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let (store, _) = store_for("me").await;
        store
            .add_paired_device(&format!("abc|1|{}", key_hex()))
            .await
            .unwrap();

        let result = store.add_paired_device(&format!("abc|2|{}", "aa".repeat(32))).await;
        assert!(matches!(result, Err(PairingError::AlreadyPaired(id)) if id == "abc"));
        assert_eq!(store.paired_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_key_rejected() {
        let (store, _) = store_for("me").await;

        let short = store.add_paired_device(&format!("abc|1|{}", "0f".repeat(31))).await;
        assert!(matches!(short, Err(PairingError::InvalidKey(_))));

        let not_hex = store.add_paired_device(&format!("abc|1|{}", "zz".repeat(32))).await;
        assert!(matches!(not_hex, Err(PairingError::InvalidKey(_))));

        assert!(store.paired_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_successful_pairing_persists() {
        let (store, persistence) = store_for("me").await;
        let code = format!("  mac-1|tag|{}\n", key_hex().to_uppercase());
        let device = store
            .add_paired_device_with_name(&code, "MacBook")
            .await
            .unwrap();

        assert_eq!(device.remote_device_id, "mac-1");
        assert_eq!(device.name, "MacBook");
        assert_eq!(device.shared_key.as_bytes(), &[0x0f; 32]);

        let stored = persistence.load_paired_devices().await.unwrap();
        assert_eq!(stored, vec![device.clone()]);

        let matching: Vec<_> = store
            .paired_devices()
            .await
            .into_iter()
            .filter(|d| d.remote_device_id == "mac-1")
            .collect();
        assert_eq!(matching.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_and_remove() {
        let (store, persistence) = store_for("me").await;
        let device = store
            .add_paired_device(&format!("mac-1|0|{}", key_hex()))
            .await
            .unwrap();

        assert_eq!(store.resolve_key("mac-1").await, Some(device.shared_key.clone()));
        assert_eq!(store.resolve_key("mac-2").await, None);

        let removed = store.remove_paired_device(&device.id).await.unwrap();
        assert_eq!(removed.id, device.id);
        assert_eq!(store.resolve_key("mac-1").await, None);
        assert!(persistence.load_paired_devices().await.unwrap().is_empty());

        assert!(matches!(
            store.remove_paired_device(&device.id).await,
            Err(PairingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_device_id_generated_once() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = PairingStore::open(persistence.clone()).await.unwrap();

        let first = store.device_id().await.unwrap();
        let second = store.device_id().await.unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(persistence.load_device_identity().await.unwrap(), Some(first.clone()));

        let reopened = PairingStore::open(persistence).await.unwrap();
        assert_eq!(reopened.device_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reload_from_persistence() {
        let persistence = Arc::new(MemoryPersistence::with_identity("me"));
        {
            let store = PairingStore::open(persistence.clone()).await.unwrap();
            store
                .add_paired_device(&format!("mac-1|0|{}", key_hex()))
                .await
                .unwrap();
        }

        let store = PairingStore::open(persistence).await.unwrap();
        assert!(store.find_by_remote_id("mac-1").await.is_some());
    }
}
