//! Duplicate detector.
//!
//! Two independent signals:
//!
//! - **Exact**: a [`Fingerprint`] over the original bytes, checked before
//!   decoding. A hit on an `active` asset of the same gallery makes the new
//!   upload a duplicate that shares the existing renditions.
//! - **Perceptual**: a 64-bit difference hash of the oriented canvas. The
//!   closest `active` asset at or above the similarity threshold is recorded
//!   as a near-duplicate for the uploader to confirm. It never merges.
//!
//! The fingerprint index entry is claimed insert-if-absent, so two
//! concurrent uploads of the same bytes cannot both become canonical.

use crate::store::{MetadataStore, StoreError, WriteOutcome};
use crate::types::{Asset, AssetStatus, NearDuplicate};
use image::DynamicImage;
use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Content fingerprint: `sha256:<hex>:<byte size>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("sha256:{digest:x}:{}", bytes.len()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// dHash: one bit per horizontally adjacent pair in a 9x8 grey reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub fn of(image: &DynamicImage) -> Self {
        let grey = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
        let mut bits = 0u64;
        for y in 0..8 {
            for x in 0..8 {
                bits <<= 1;
                if grey.get_pixel(x, y)[0] < grey.get_pixel(x + 1, y)[0] {
                    bits |= 1;
                }
            }
        }
        Self(bits)
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(Self)
    }

    pub fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// 1.0 for identical hashes, 0.0 when every bit differs.
    pub fn similarity(self, other: Self) -> f64 {
        1.0 - f64::from(self.distance(other)) / 64.0
    }
}

pub struct DuplicateDetector {
    store: Arc<dyn MetadataStore>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// The `active` asset in `gallery_id` already holding these bytes, other
    /// than `asset_id` itself.
    pub fn find_exact(
        &self,
        gallery_id: &str,
        fingerprint: &Fingerprint,
        asset_id: &str,
    ) -> Result<Option<Asset>, StoreError> {
        let Some(owner) = self.store.lookup_fingerprint(gallery_id, fingerprint.as_str())? else {
            return Ok(None);
        };
        if owner == asset_id {
            return Ok(None);
        }
        Ok(self
            .store
            .get_asset(&owner)?
            .map(|v| v.value)
            .filter(|a| a.status == AssetStatus::Active && !a.renditions.is_empty()))
    }

    /// Make `asset_id` the canonical holder of `fingerprint` if nobody live holds it.
    ///
    /// Returns whether `asset_id` owns the entry afterwards. An entry left by
    /// a failed or deleted asset is taken over.
    pub fn claim(&self, gallery_id: &str, fingerprint: &Fingerprint, asset_id: &str) -> Result<bool, StoreError> {
        let fp = fingerprint.as_str();
        if self.store.insert_fingerprint(gallery_id, fp, asset_id)?.is_written() {
            return Ok(true);
        }
        let Some(owner) = self.store.lookup_fingerprint(gallery_id, fp)? else {
            // Released between the insert and the lookup.
            return Ok(self.store.insert_fingerprint(gallery_id, fp, asset_id)?.is_written());
        };
        if owner == asset_id {
            return Ok(true);
        }
        let abandoned = match self.store.get_asset(&owner)? {
            None => true,
            Some(v) => v.value.status == AssetStatus::Failed,
        };
        if abandoned {
            log::debug!("asset {asset_id}: taking over fingerprint from abandoned asset {owner}");
            return Ok(self.store.repoint_fingerprint(gallery_id, fp, &owner, asset_id)?.is_written());
        }
        Ok(false)
    }

    /// Most similar canonical `active` asset at or above `threshold`.
    pub fn find_near(
        &self,
        gallery_id: &str,
        asset_id: &str,
        hash: PerceptualHash,
        threshold: f64,
    ) -> Result<Option<NearDuplicate>, StoreError> {
        let mut best: Option<(f64, Asset)> = None;
        for candidate in self.store.list_gallery(gallery_id)? {
            if candidate.id == asset_id || candidate.status != AssetStatus::Active || candidate.duplicate_of.is_some() {
                continue;
            }
            let Some(other) = candidate.perceptual_hash.as_deref().and_then(PerceptualHash::from_hex) else {
                continue;
            };
            let similarity = hash.similarity(other);
            if similarity < threshold {
                continue;
            }
            // Ties go to the older upload.
            let better = match &best {
                None => true,
                Some((s, current)) => {
                    similarity > *s || (similarity == *s && candidate.created_at < current.created_at)
                }
            };
            if better {
                best = Some((similarity, candidate));
            }
        }
        Ok(best.map(|(similarity, asset)| NearDuplicate {
            asset_id: asset.id,
            similarity,
        }))
    }

    /// Drop `asset`'s hold on its fingerprint, handing it to another active
    /// asset with the same bytes when one exists.
    pub fn release(&self, asset: &Asset) -> Result<(), StoreError> {
        let Some(fp) = asset.fingerprint.as_deref() else {
            return Ok(());
        };
        let owner = self.store.lookup_fingerprint(&asset.gallery_id, fp)?;
        if owner.as_deref() != Some(asset.id.as_str()) {
            return Ok(());
        }
        let heir = self
            .store
            .list_gallery(&asset.gallery_id)?
            .into_iter()
            .filter(|a| a.id != asset.id && a.status == AssetStatus::Active)
            .filter(|a| a.fingerprint.as_deref() == Some(fp))
            .min_by_key(|a| a.created_at);
        match heir {
            Some(heir) => {
                if let WriteOutcome::Conflict = self.store.repoint_fingerprint(&asset.gallery_id, fp, &asset.id, &heir.id)? {
                    log::warn!("asset {}: fingerprint changed hands during release", asset.id);
                } else {
                    log::debug!("asset {}: fingerprint handed to {}", asset.id, heir.id);
                }
                Ok(())
            }
            None => self.store.remove_fingerprint(&asset.gallery_id, fp, &asset.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Rendition, RenditionFormat, SizeClass};
    use chrono::{DateTime, Utc};
    use image::{Luma, RgbImage};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn store_asset(store: &MemoryStore, id: &str, status: AssetStatus, hash: Option<u64>, fp: Option<&str>) {
        let mut asset = Asset::pending(id, "g1", &format!("originals/g1/{id}/x.jpg"), "x.jpg", 10, now());
        asset.status = status;
        asset.perceptual_hash = hash.map(|h| PerceptualHash(h).to_hex());
        asset.fingerprint = fp.map(str::to_string);
        if status == AssetStatus::Active {
            asset.renditions.push(Rendition {
                size: SizeClass::Small,
                key: format!("renditions/g1/{id}/small.jpg"),
                url: String::new(),
                width: 1,
                height: 1,
                byte_size: 1,
                format: RenditionFormat::Jpeg,
                watermarked: false,
            });
        }
        store.create_asset(&asset).unwrap();
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    #[test]
    fn fingerprint_encodes_digest_and_size() {
        let fp = Fingerprint::of(b"abc");
        assert_eq!(
            fp.as_str(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad:3"
        );
    }

    #[test]
    fn dhash_of_horizontal_ramp_sets_every_bit() {
        let ramp = DynamicImage::ImageLuma8(image::ImageBuffer::from_fn(90, 80, |x, _| Luma([(x * 2) as u8])));
        assert_eq!(PerceptualHash::of(&ramp).0, u64::MAX);
    }

    #[test]
    fn dhash_survives_rescaling() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(256, 192, |x, y| {
            let v = 128.0 + 60.0 * (x as f32 / 20.0).sin() + 60.0 * (y as f32 / 15.0).cos();
            image::Rgb([v as u8, v as u8, (y % 256) as u8])
        }));
        let smaller = img.resize_exact(128, 96, FilterType::Lanczos3);
        let a = PerceptualHash::of(&img);
        let b = PerceptualHash::of(&smaller);
        assert!(a.similarity(b) >= 0.85, "similarity {}", a.similarity(b));
    }

    #[test]
    fn hash_hex_round_trip_and_similarity() {
        let h = PerceptualHash(0x0123_4567_89ab_cdef);
        assert_eq!(PerceptualHash::from_hex(&h.to_hex()), Some(h));
        assert_eq!(h.similarity(h), 1.0);
        assert_eq!(PerceptualHash(0).similarity(PerceptualHash(u64::MAX)), 0.0);
        assert_eq!(PerceptualHash(0).distance(PerceptualHash(0b1011)), 3);
    }

    // =========================================================================
    // Exact lookup and claim
    // =========================================================================

    #[test]
    fn exact_hit_requires_active_owner() {
        let store = Arc::new(MemoryStore::new());
        let fp = Fingerprint::of(b"same bytes");
        store_asset(&store, "a1", AssetStatus::Processing, None, Some(fp.as_str()));
        store.insert_fingerprint("g1", fp.as_str(), "a1").unwrap();
        let detector = DuplicateDetector::new(store.clone());

        assert!(detector.find_exact("g1", &fp, "a2").unwrap().is_none());

        let mut a1 = store.get_asset("a1").unwrap().unwrap();
        a1.value.status = AssetStatus::Active;
        a1.value.renditions = vec![];
        store.update_asset(&a1.value, a1.version).unwrap();
        // Active but without renditions is not a usable canonical.
        assert!(detector.find_exact("g1", &fp, "a2").unwrap().is_none());
    }

    #[test]
    fn exact_hit_on_active_asset() {
        let store = Arc::new(MemoryStore::new());
        let fp = Fingerprint::of(b"same bytes");
        store_asset(&store, "a1", AssetStatus::Active, None, Some(fp.as_str()));
        store.insert_fingerprint("g1", fp.as_str(), "a1").unwrap();
        let detector = DuplicateDetector::new(store);

        assert_eq!(detector.find_exact("g1", &fp, "a2").unwrap().unwrap().id, "a1");
        // An asset never duplicates itself.
        assert!(detector.find_exact("g1", &fp, "a1").unwrap().is_none());
        // Fingerprints are per gallery.
        assert!(detector.find_exact("g2", &fp, "a2").unwrap().is_none());
    }

    #[test]
    fn claim_is_insert_if_absent() {
        let store = Arc::new(MemoryStore::new());
        store_asset(&store, "a1", AssetStatus::Processing, None, None);
        let detector = DuplicateDetector::new(store);
        let fp = Fingerprint::of(b"x");
        assert!(detector.claim("g1", &fp, "a1").unwrap());
        assert!(detector.claim("g1", &fp, "a1").unwrap());
        assert!(!detector.claim("g1", &fp, "a2").unwrap());
    }

    #[test]
    fn claim_takes_over_from_failed_owner() {
        let store = Arc::new(MemoryStore::new());
        store_asset(&store, "a1", AssetStatus::Failed, None, None);
        let fp = Fingerprint::of(b"x");
        store.insert_fingerprint("g1", fp.as_str(), "a1").unwrap();
        let detector = DuplicateDetector::new(store.clone());
        assert!(detector.claim("g1", &fp, "a2").unwrap());
        assert_eq!(store.lookup_fingerprint("g1", fp.as_str()).unwrap().as_deref(), Some("a2"));
    }

    // =========================================================================
    // Near duplicates
    // =========================================================================

    #[test]
    fn near_picks_closest_active_above_threshold() {
        let store = Arc::new(MemoryStore::new());
        store_asset(&store, "far", AssetStatus::Active, Some(0xFFFF_0000_0000_0000), None);
        store_asset(&store, "close", AssetStatus::Active, Some(0b11), None);
        store_asset(&store, "pending", AssetStatus::Pending, Some(0), None);
        let detector = DuplicateDetector::new(store);

        let near = detector.find_near("g1", "new", PerceptualHash(0), 0.9).unwrap().unwrap();
        assert_eq!(near.asset_id, "close");
        assert!((near.similarity - 62.0 / 64.0).abs() < 1e-9);

        assert!(detector.find_near("g1", "new", PerceptualHash(0), 0.99).unwrap().is_none());
    }

    // =========================================================================
    // Release
    // =========================================================================

    #[test]
    fn release_hands_fingerprint_to_surviving_copy() {
        let store = Arc::new(MemoryStore::new());
        let fp = "sha256:x:1";
        store_asset(&store, "a1", AssetStatus::Active, None, Some(fp));
        store_asset(&store, "a2", AssetStatus::Active, None, Some(fp));
        store.insert_fingerprint("g1", fp, "a1").unwrap();
        let detector = DuplicateDetector::new(store.clone());

        let a1 = store.get_asset("a1").unwrap().unwrap().value;
        detector.release(&a1).unwrap();
        assert_eq!(store.lookup_fingerprint("g1", fp).unwrap().as_deref(), Some("a2"));

        let a2 = store.get_asset("a2").unwrap().unwrap().value;
        store.delete_asset("a1", 1).unwrap();
        detector.release(&a2).unwrap();
        assert_eq!(store.lookup_fingerprint("g1", fp).unwrap(), None);
    }
}
