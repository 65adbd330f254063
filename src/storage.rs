//! Object storage for originals and renditions.
//!
//! ## Key layout
//!
//! ```text
//! originals/{galleryId}/{assetId}/{filename}      ← written by the upload path
//! renditions/{galleryId}/{assetId}/{class}.{ext}  ← written only by this pipeline
//! ```
//!
//! The CDN serves `renditions/` as static files at
//! `{base_url}/{galleryId}/{assetId}/{class}.{ext}`.

use crate::types::{RenditionFormat, SizeClass};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Byte-level object store. Implementations must make `put` atomic: a
/// reader never observes a partially written object.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    /// Deleting a missing object succeeds.
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

// ============================================================================
// Key conventions
// ============================================================================

/// Components of an `originals/{galleryId}/{assetId}/{filename}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalKey {
    pub gallery_id: String,
    pub asset_id: String,
    pub filename: String,
}

impl OriginalKey {
    /// Parse an upload key. Ids must be non-empty `[A-Za-z0-9_-]`.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, '/');
        if parts.next()? != "originals" {
            return None;
        }
        let gallery_id = parts.next()?;
        let asset_id = parts.next()?;
        let filename = parts.next()?;
        if !is_valid_id(gallery_id) || !is_valid_id(asset_id) {
            return None;
        }
        if filename.is_empty() || filename.contains('/') {
            return None;
        }
        Some(Self {
            gallery_id: gallery_id.to_string(),
            asset_id: asset_id.to_string(),
            filename: filename.to_string(),
        })
    }

    pub fn to_key(&self) -> String {
        format!("originals/{}/{}/{}", self.gallery_id, self.asset_id, self.filename)
    }
}

pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn rendition_key(gallery_id: &str, asset_id: &str, class: SizeClass, format: RenditionFormat) -> String {
    format!(
        "renditions/{gallery_id}/{asset_id}/{class}.{}",
        format.extension()
    )
}

pub fn cdn_url(
    base_url: &str,
    gallery_id: &str,
    asset_id: &str,
    class: SizeClass,
    format: RenditionFormat,
) -> String {
    format!(
        "{}/{gallery_id}/{asset_id}/{class}.{}",
        base_url.trim_end_matches('/'),
        format.extension()
    )
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Objects as files under `root`; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

fn io_err(key: &str) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                io_err(key)(e)
            }
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(dir).map_err(io_err(key))?;
        // Write beside the target and rename so readers never see a partial object.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(key))?;
        io::Write::write_all(&mut tmp, bytes).map_err(io_err(key))?;
        tmp.persist(&path).map_err(|e| io_err(key)(e.error))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key)?.is_file())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Map-backed store that counts writes, for "no duplicate writes" checks.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(key))
    }
}
