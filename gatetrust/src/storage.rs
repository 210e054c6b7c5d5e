//! Secure local storage for agent credentials.
//!
//! The gateway only needs three capabilities from the host: `store`, `load`
//! and `delete` of opaque blobs by key. [`MemoryStore`] backs tests,
//! [`FileStore`] keeps one file per key in a directory and replaces it
//! atomically (temp file, then rename).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::hash::{b64url_decode, b64url_encode};
use crate::crypto::identity::IdentityKeyPair;
use crate::error::{GateTrustError, Result};

/// Storage key under which [`DeviceKeys`] are persisted.
pub const DEVICE_KEYS_KEY: &str = "device-keys";

/// Blob store capability.
pub trait SecureStore: Send + Sync {
    fn store(&self, key: &str, blob: &[u8]) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-process store. Contents vanish with the value.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn store(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), Zeroizing::new(blob.to_vec()));
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).map(|b| b.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Directory-backed store: `<dir>/<key>.bin`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| GateTrustError::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key.len() <= 128
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(GateTrustError::Storage(format!("invalid key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.bin")))
    }
}

impl SecureStore for FileStore {
    fn store(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut opts = fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            GateTrustError::Storage(format!("write {key}: {e}"))
        })
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GateTrustError::Storage(format!("read {key}: {e}"))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GateTrustError::Storage(format!("delete {key}: {e}"))),
        }
    }
}

/// Everything an agent needs to reconnect after a restart.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKeys {
    pub device_id: String,
    /// Ed25519 seed of the device identity.
    pub identity_seed: [u8; 32],
    pub platform_url: String,
    /// Pinned fingerprint of the platform's long-term key.
    pub platform_fingerprint: String,
    /// Outbound sequence reached by the previous session. Informational
    /// only: every session restarts its counters at 0 under fresh keys, so
    /// this is never fed back into a replay window.
    pub last_sequence: u64,
}

impl std::fmt::Debug for DeviceKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeys")
            .field("device_id", &self.device_id)
            .field("identity_seed", &"<redacted>")
            .field("platform_url", &self.platform_url)
            .field("platform_fingerprint", &self.platform_fingerprint)
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceKeysRecord {
    device_id: String,
    identity_seed: String,
    platform_url: String,
    platform_fingerprint: String,
    #[serde(default)]
    last_sequence: u64,
}

impl Drop for DeviceKeysRecord {
    fn drop(&mut self) {
        self.identity_seed.zeroize();
    }
}

impl DeviceKeys {
    pub fn new(
        device_id: impl Into<String>,
        identity: &IdentityKeyPair,
        platform_url: impl Into<String>,
        platform_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            identity_seed: *identity.seed(),
            platform_url: platform_url.into(),
            platform_fingerprint: platform_fingerprint.into(),
            last_sequence: 0,
        }
    }

    /// Rebuild the device identity key pair.
    pub fn identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::from_seed(&self.identity_seed)
    }

    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>> {
        let record = DeviceKeysRecord {
            device_id: self.device_id.clone(),
            identity_seed: b64url_encode(&self.identity_seed),
            platform_url: self.platform_url.clone(),
            platform_fingerprint: self.platform_fingerprint.clone(),
            last_sequence: self.last_sequence,
        };
        Ok(Zeroizing::new(serde_json::to_vec(&record)?))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let record: DeviceKeysRecord = serde_json::from_slice(bytes)?;
        let seed = Zeroizing::new(b64url_decode(&record.identity_seed).unwrap_or_default());
        let identity_seed = <[u8; 32]>::try_from(seed.as_slice())
            .map_err(|_| GateTrustError::Storage("identity seed must be 32 bytes".into()))?;
        Ok(Self {
            device_id: record.device_id.clone(),
            identity_seed,
            platform_url: record.platform_url.clone(),
            platform_fingerprint: record.platform_fingerprint.clone(),
            last_sequence: record.last_sequence,
        })
    }

    /// Persist under [`DEVICE_KEYS_KEY`].
    pub fn save(&self, store: &dyn SecureStore) -> Result<()> {
        store.store(DEVICE_KEYS_KEY, &self.to_json()?)
    }

    /// Load from [`DEVICE_KEYS_KEY`], if present.
    pub fn load(store: &dyn SecureStore) -> Result<Option<Self>> {
        match store.load(DEVICE_KEYS_KEY)? {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Self::from_json(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn forget(store: &dyn SecureStore) -> Result<()> {
        store.delete(DEVICE_KEYS_KEY)
    }
}
