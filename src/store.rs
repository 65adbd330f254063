//! Metadata store: asset records, the fingerprint index, and TTL entries.
//!
//! This is the single shared mutable resource between workers. Every asset
//! write is a compare-and-swap on a version number, so two concurrent
//! dispatches of the same object can never both win a transition.
//!
//! ## FileStore layout
//!
//! ```text
//! state/
//! ├── .lock                                   # advisory write lock (never removed)
//! ├── assets/{assetId}.json                   # {"version": n, "asset": {...}}
//! ├── fingerprints/{galleryId}/{fp}.json      # {"assetId": "..."}
//! └── ephemeral/{key}.json                    # {"value": "...", "expiresAt": "..."}
//! ```

use crate::types::Asset;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lock: {0}")]
    Lock(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// A record together with the version its next conditional write must name.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Result of a conditional write. Losing a race is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    Conflict,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

pub trait MetadataStore: Send + Sync {
    fn get_asset(&self, id: &str) -> Result<Option<Versioned<Asset>>, StoreError>;

    /// Insert if no record with this id exists; `Conflict` otherwise.
    fn create_asset(&self, asset: &Asset) -> Result<WriteOutcome, StoreError>;

    /// Replace the record only if it is still at `expected_version`.
    fn update_asset(&self, asset: &Asset, expected_version: u64) -> Result<WriteOutcome, StoreError>;

    /// Remove the record only if it is still at `expected_version`.
    fn delete_asset(&self, id: &str, expected_version: u64) -> Result<WriteOutcome, StoreError>;

    /// Every asset of a gallery, in no particular order.
    fn list_gallery(&self, gallery_id: &str) -> Result<Vec<Asset>, StoreError>;

    /// Map `(gallery, fingerprint)` to `asset_id` unless already mapped.
    fn insert_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str)
    -> Result<WriteOutcome, StoreError>;

    fn lookup_fingerprint(&self, gallery_id: &str, fingerprint: &str) -> Result<Option<String>, StoreError>;

    /// Point an entry owned by `from` at `to`; `Conflict` if `from` no longer owns it.
    fn repoint_fingerprint(&self, gallery_id: &str, fingerprint: &str, from: &str, to: &str)
    -> Result<WriteOutcome, StoreError>;

    /// Drop the entry if it is owned by `asset_id`.
    fn remove_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str) -> Result<(), StoreError>;

    fn put_ephemeral(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    fn get_ephemeral(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError>;

    /// Live entries under `prefix`. Prefixes end at a `/` boundary.
    fn count_ephemeral(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    assets: HashMap<String, Versioned<Asset>>,
    fingerprints: HashMap<(String, String), String>,
    ephemeral: BTreeMap<String, (String, DateTime<Utc>)>,
}

/// Mutex-guarded maps. Used in tests and single-process tools.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetadataStore for MemoryStore {
    fn get_asset(&self, id: &str) -> Result<Option<Versioned<Asset>>, StoreError> {
        Ok(self.lock().assets.get(id).cloned())
    }

    fn create_asset(&self, asset: &Asset) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        if inner.assets.contains_key(&asset.id) {
            return Ok(WriteOutcome::Conflict);
        }
        inner.assets.insert(
            asset.id.clone(),
            Versioned {
                version: 1,
                value: asset.clone(),
            },
        );
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn update_asset(&self, asset: &Asset, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        match inner.assets.get_mut(&asset.id) {
            Some(current) if current.version == expected_version => {
                current.version += 1;
                current.value = asset.clone();
                Ok(WriteOutcome::Written {
                    version: current.version,
                })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn delete_asset(&self, id: &str, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        match inner.assets.get(id) {
            Some(current) if current.version == expected_version => {
                inner.assets.remove(id);
                Ok(WriteOutcome::Written {
                    version: expected_version + 1,
                })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn list_gallery(&self, gallery_id: &str) -> Result<Vec<Asset>, StoreError> {
        Ok(self
            .lock()
            .assets
            .values()
            .filter(|v| v.value.gallery_id == gallery_id)
            .map(|v| v.value.clone())
            .collect())
    }

    fn insert_fingerprint(
        &self,
        gallery_id: &str,
        fingerprint: &str,
        asset_id: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        let key = (gallery_id.to_string(), fingerprint.to_string());
        if inner.fingerprints.contains_key(&key) {
            return Ok(WriteOutcome::Conflict);
        }
        inner.fingerprints.insert(key, asset_id.to_string());
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn lookup_fingerprint(&self, gallery_id: &str, fingerprint: &str) -> Result<Option<String>, StoreError> {
        let key = (gallery_id.to_string(), fingerprint.to_string());
        Ok(self.lock().fingerprints.get(&key).cloned())
    }

    fn repoint_fingerprint(
        &self,
        gallery_id: &str,
        fingerprint: &str,
        from: &str,
        to: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        let key = (gallery_id.to_string(), fingerprint.to_string());
        match inner.fingerprints.get_mut(&key) {
            Some(owner) if owner == from => {
                *owner = to.to_string();
                Ok(WriteOutcome::Written { version: 1 })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn remove_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (gallery_id.to_string(), fingerprint.to_string());
        if inner.fingerprints.get(&key).is_some_and(|owner| owner == asset_id) {
            inner.fingerprints.remove(&key);
        }
        Ok(())
    }

    fn put_ephemeral(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.lock()
            .ephemeral
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn get_ephemeral(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .ephemeral
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone()))
    }

    fn count_ephemeral(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        inner.ephemeral.retain(|_, (_, expires)| *expires > now);
        Ok(inner.ephemeral.keys().filter(|k| k.starts_with(prefix)).count())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
struct AssetDocument {
    version: u64,
    asset: Asset,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintDocument {
    asset_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralDocument {
    value: String,
    expires_at: DateTime<Utc>,
}

/// One JSON document per record under a state directory.
///
/// Writes are serialised across processes by an OS advisory lock on
/// `.lock` and land through an atomic rename, so readers never take the
/// lock. The OS drops the lock with its holder, so a crashed writer never
/// leaves the store locked.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

struct LockGuard {
    file: fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("failed to unlock the state directory: {e}");
        }
    }
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["assets", "fingerprints", "ephemeral"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<LockGuard, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::Lock(format!("{}: {e}", path.display())))?;
        Ok(LockGuard { file })
    }

    fn asset_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !crate::storage::is_valid_id(id) {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
        Ok(self.root.join("assets").join(format!("{id}.json")))
    }

    fn fingerprint_path(&self, gallery_id: &str, fingerprint: &str) -> Result<PathBuf, StoreError> {
        let name: String = fingerprint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if !crate::storage::is_valid_id(gallery_id) || name.is_empty() {
            return Err(StoreError::InvalidKey(format!("{gallery_id}/{fingerprint}")));
        }
        Ok(self
            .root
            .join("fingerprints")
            .join(gallery_id)
            .join(format!("{name}.json")))
    }

    fn ephemeral_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = relative_key(key)?;
        let mut path = self.root.join("ephemeral").join(rel);
        let file = format!(
            "{}.json",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        );
        path.set_file_name(file);
        Ok(path)
    }

    fn read_asset(&self, path: &Path) -> Result<Option<AssetDocument>, StoreError> {
        read_json(path)
    }
}

fn relative_key(key: &str) -> Result<&Path, StoreError> {
    let path = Path::new(key.trim_end_matches('/'));
    let clean = !key.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(path)
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl MetadataStore for FileStore {
    fn get_asset(&self, id: &str) -> Result<Option<Versioned<Asset>>, StoreError> {
        Ok(self.read_asset(&self.asset_path(id)?)?.map(|doc| Versioned {
            version: doc.version,
            value: doc.asset,
        }))
    }

    fn create_asset(&self, asset: &Asset) -> Result<WriteOutcome, StoreError> {
        let path = self.asset_path(&asset.id)?;
        let _guard = self.lock()?;
        if path.exists() {
            return Ok(WriteOutcome::Conflict);
        }
        write_json_atomic(
            &path,
            &AssetDocument {
                version: 1,
                asset: asset.clone(),
            },
        )?;
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn update_asset(&self, asset: &Asset, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        let path = self.asset_path(&asset.id)?;
        let _guard = self.lock()?;
        match self.read_asset(&path)? {
            Some(doc) if doc.version == expected_version => {
                let version = expected_version + 1;
                write_json_atomic(
                    &path,
                    &AssetDocument {
                        version,
                        asset: asset.clone(),
                    },
                )?;
                Ok(WriteOutcome::Written { version })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn delete_asset(&self, id: &str, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        let path = self.asset_path(id)?;
        let _guard = self.lock()?;
        match self.read_asset(&path)? {
            Some(doc) if doc.version == expected_version => {
                remove_if_exists(&path)?;
                Ok(WriteOutcome::Written {
                    version: expected_version + 1,
                })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn list_gallery(&self, gallery_id: &str) -> Result<Vec<Asset>, StoreError> {
        let mut assets = Vec::new();
        for entry in WalkDir::new(self.root.join("assets"))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            if let Some(doc) = self.read_asset(entry.path())?
                && doc.asset.gallery_id == gallery_id
            {
                assets.push(doc.asset);
            }
        }
        Ok(assets)
    }

    fn insert_fingerprint(
        &self,
        gallery_id: &str,
        fingerprint: &str,
        asset_id: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let path = self.fingerprint_path(gallery_id, fingerprint)?;
        let _guard = self.lock()?;
        if path.exists() {
            return Ok(WriteOutcome::Conflict);
        }
        write_json_atomic(
            &path,
            &FingerprintDocument {
                asset_id: asset_id.to_string(),
            },
        )?;
        Ok(WriteOutcome::Written { version: 1 })
    }

    fn lookup_fingerprint(&self, gallery_id: &str, fingerprint: &str) -> Result<Option<String>, StoreError> {
        let path = self.fingerprint_path(gallery_id, fingerprint)?;
        Ok(read_json::<FingerprintDocument>(&path)?.map(|doc| doc.asset_id))
    }

    fn repoint_fingerprint(
        &self,
        gallery_id: &str,
        fingerprint: &str,
        from: &str,
        to: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let path = self.fingerprint_path(gallery_id, fingerprint)?;
        let _guard = self.lock()?;
        match read_json::<FingerprintDocument>(&path)? {
            Some(doc) if doc.asset_id == from => {
                write_json_atomic(
                    &path,
                    &FingerprintDocument {
                        asset_id: to.to_string(),
                    },
                )?;
                Ok(WriteOutcome::Written { version: 1 })
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    fn remove_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str) -> Result<(), StoreError> {
        let path = self.fingerprint_path(gallery_id, fingerprint)?;
        let _guard = self.lock()?;
        if let Some(doc) = read_json::<FingerprintDocument>(&path)?
            && doc.asset_id == asset_id
        {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    fn put_ephemeral(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let path = self.ephemeral_path(key)?;
        write_json_atomic(
            &path,
            &EphemeralDocument {
                value: value.to_string(),
                expires_at,
            },
        )
    }

    fn get_ephemeral(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let path = self.ephemeral_path(key)?;
        Ok(read_json::<EphemeralDocument>(&path)?
            .filter(|doc| doc.expires_at > now)
            .map(|doc| doc.value))
    }

    fn count_ephemeral(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let dir = self.root.join("ephemeral").join(relative_key(prefix)?);
        let mut live = 0;
        for entry in WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            match read_json::<EphemeralDocument>(entry.path()) {
                Ok(Some(doc)) if doc.expires_at > now => live += 1,
                Ok(Some(_)) => {
                    // Expired entries are garbage-collected on read.
                    let _ = fs::remove_file(entry.path());
                }
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable {}: {e}", entry.path().display()),
            }
        }
        Ok(live)
    }
}
