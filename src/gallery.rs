//! Read-side views and deletion for gallery clients.
//!
//! Listings only ever show `active` assets; everything else is visible
//! through the per-asset status view the uploader polls.

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::fingerprint::DuplicateDetector;
use crate::status::StatusManager;
use crate::storage::{ObjectStore, StorageError};
use crate::store::{MetadataStore, StoreError, WriteOutcome};
use crate::types::{Asset, AssetStatus, NearDuplicate, SizeClass};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What an uploader's status poll returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub id: String,
    pub status: AssetStatus,
    pub renditions: Vec<RenditionView>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near_duplicate: Option<NearDuplicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionView {
    pub size: SizeClass,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl From<&Asset> for StatusView {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id.clone(),
            status: asset.status,
            renditions: asset
                .renditions
                .iter()
                .map(|r| RenditionView {
                    size: r.size,
                    url: r.url.clone(),
                    width: r.width,
                    height: r.height,
                })
                .collect(),
            error: asset.error.clone(),
            duplicate_of: asset.duplicate_of.clone(),
            near_duplicate: asset.near_duplicate.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted {
        /// Objects removed from storage.
        removed: Vec<String>,
        /// Rendition keys left in place because another asset shares them.
        shared: Vec<String>,
    },
    /// A worker holds the claim; delete after it finishes.
    InFlight,
    /// The record changed between read and delete.
    Changed,
    Missing,
}

pub struct Gallery {
    store: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    status: StatusManager,
    duplicates: DuplicateDetector,
}

impl Gallery {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            status: StatusManager::new(store.clone(), clock, dispatch),
            duplicates: DuplicateDetector::new(store.clone()),
            store,
            objects,
        }
    }

    /// Active assets in upload order.
    pub fn visible_assets(&self, gallery_id: &str) -> Result<Vec<Asset>, GalleryError> {
        let mut assets: Vec<Asset> = self
            .store
            .list_gallery(gallery_id)?
            .into_iter()
            .filter(Asset::is_visible)
            .collect();
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    /// Every asset of the gallery regardless of status, in upload order.
    pub fn all_assets(&self, gallery_id: &str) -> Result<Vec<Asset>, GalleryError> {
        let mut assets = self.store.list_gallery(gallery_id)?;
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    pub fn asset(&self, asset_id: &str) -> Result<Option<Asset>, GalleryError> {
        Ok(self.store.get_asset(asset_id)?.map(|v| v.value))
    }

    pub fn status_view(&self, asset_id: &str) -> Result<Option<StatusView>, GalleryError> {
        Ok(self.asset(asset_id)?.map(|a| StatusView::from(&a)))
    }

    /// Remove an asset, its original, and every rendition no other asset shares.
    ///
    /// The record goes first so a partial failure leaves orphaned objects,
    /// never a record pointing at deleted ones.
    pub fn delete_asset(&self, asset_id: &str) -> Result<DeleteOutcome, GalleryError> {
        let Some(current) = self.status.get(asset_id)? else {
            return Ok(DeleteOutcome::Missing);
        };
        if current.value.status == AssetStatus::Processing {
            log::warn!("asset {asset_id}: refusing to delete while processing");
            return Ok(DeleteOutcome::InFlight);
        }
        if let WriteOutcome::Conflict = self.status.delete(&current)? {
            return Ok(DeleteOutcome::Changed);
        }
        let asset = current.value;
        self.duplicates.release(&asset)?;

        let still_referenced: HashSet<String> = self
            .store
            .list_gallery(&asset.gallery_id)?
            .into_iter()
            .filter(|a| a.id != asset.id)
            .flat_map(|a| a.renditions.into_iter().map(|r| r.key))
            .collect();

        let mut removed = Vec::new();
        let mut shared = Vec::new();
        for rendition in &asset.renditions {
            if still_referenced.contains(&rendition.key) {
                shared.push(rendition.key.clone());
            } else {
                self.objects.delete(&rendition.key)?;
                removed.push(rendition.key.clone());
            }
        }
        if asset.original_retained {
            self.objects.delete(&asset.original_key)?;
            removed.push(asset.original_key.clone());
        }
        log::info!(
            "asset {asset_id}: deleted ({} objects removed, {} shared renditions kept)",
            removed.len(),
            shared.len()
        );
        Ok(DeleteOutcome::Deleted { removed, shared })
    }

    /// Delete every asset in the gallery. Returns how many were deleted;
    /// assets mid-processing are left for a later pass.
    pub fn delete_gallery(&self, gallery_id: &str) -> Result<usize, GalleryError> {
        let mut deleted = 0;
        for asset in self.all_assets(gallery_id)? {
            match self.delete_asset(&asset.id)? {
                DeleteOutcome::Deleted { .. } => deleted += 1,
                other => log::warn!("asset {}: not deleted with gallery {gallery_id}: {other:?}", asset.id),
            }
        }
        Ok(deleted)
    }
}
