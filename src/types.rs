//! Shared types persisted in the metadata store and exchanged between stages.
//!
//! These are serialized with camelCase field names because the same JSON
//! documents are read by the status-polling API and the gallery listing.

use crate::format::MediaFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Notification delivered once (or more) per completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressEvent {
    pub bucket_name: String,
    pub object_key: String,
    pub size: u64,
}

/// Processing lifecycle of an [`Asset`].
///
/// ```text
/// pending → processing → active
///    └──────────┴──────→ failed ──(operator requeue)──→ pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Processing,
    Active,
    Failed,
}

impl AssetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    /// `active` and `failed` are only left through deletion, an operator
    /// requeue, or undoing a duplicate share whose canonical asset vanished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed rendition size classes, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Thumbnail,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [Self::Thumbnail, Self::Small, Self::Medium, Self::Large];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thumbnail" => Ok(Self::Thumbnail),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(format!("unknown size class: {s}")),
        }
    }
}

/// The single output encoding used for every rendition regardless of source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionFormat {
    #[default]
    Jpeg,
    Avif,
}

impl RenditionFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Avif => "image/avif",
        }
    }
}

/// A derived, pre-computed output image owned by exactly one [`Asset`]
/// (duplicates reference the canonical asset's renditions by key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rendition {
    pub size: SizeClass,
    pub key: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: RenditionFormat,
    #[serde(default)]
    pub watermarked: bool,
}

/// The plan terms a rendition set was produced under.
///
/// An exact duplicate may only share renditions made under the terms its
/// own gallery requires today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenditionPolicy {
    pub watermark: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resolution: Option<u32>,
    /// Size class left unmarked for original-quality downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_exempt: Option<SizeClass>,
}

/// Perceptually similar asset flagged for the uploader to confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearDuplicate {
    pub asset_id: String,
    pub similarity: f64,
}

/// One uploaded original and its processing state.
///
/// Only the status manager writes these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub gallery_id: String,
    pub original_key: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_extension: Option<String>,
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perceptual_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MediaFormat>,
    pub status: AssetStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub renditions: Vec<Rendition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RenditionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_duplicate: Option<NearDuplicate>,
    #[serde(default = "default_true")]
    pub original_retained: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Asset {
    /// A freshly uploaded original awaiting its first dispatch.
    pub fn pending(
        id: &str,
        gallery_id: &str,
        original_key: &str,
        filename: &str,
        byte_size: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let declared_extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        Self {
            id: id.to_string(),
            gallery_id: gallery_id.to_string(),
            original_key: original_key.to_string(),
            filename: filename.to_string(),
            declared_extension,
            byte_size,
            fingerprint: None,
            perceptual_hash: None,
            format: None,
            status: AssetStatus::Pending,
            attempts: 0,
            renditions: Vec::new(),
            policy: None,
            duplicate_of: None,
            near_duplicate: None,
            original_retained: true,
            error: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processed_at: None,
        }
    }

    /// Gallery listings include an asset only once it is `active`.
    pub fn is_visible(&self) -> bool {
        self.status == AssetStatus::Active
    }

    pub fn rendition(&self, size: SizeClass) -> Option<&Rendition> {
        self.renditions.iter().find(|r| r.size == size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn ingress_event_uses_camel_case() {
        let json = r#"{"bucketName":"uploads","objectKey":"originals/g1/a1/IMG_1.jpg","size":42}"#;
        let event: IngressEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.bucket_name, "uploads");
        assert_eq!(event.object_key, "originals/g1/a1/IMG_1.jpg");
        assert_eq!(event.size, 42);
    }

    #[test]
    fn pending_asset_derives_extension() {
        let asset = Asset::pending("a1", "g1", "originals/g1/a1/DSC_0001.NEF", "DSC_0001.NEF", 10, now());
        assert_eq!(asset.declared_extension.as_deref(), Some("nef"));
        assert_eq!(asset.status, AssetStatus::Pending);
        assert!(!asset.is_visible());
        assert!(asset.original_retained);
    }

    #[test]
    fn asset_serializes_schema_field_names() {
        let asset = Asset::pending("a1", "g1", "originals/g1/a1/x.jpg", "x.jpg", 10, now());
        let value = serde_json::to_value(&asset).unwrap();
        assert_eq!(value["galleryId"], "g1");
        assert_eq!(value["originalKey"], "originals/g1/a1/x.jpg");
        assert_eq!(value["status"], "pending");
        assert!(value.get("createdAt").is_some());
        assert!(value["error"].is_null());
    }

    #[test]
    fn size_class_parses_case_insensitively() {
        assert_eq!("Large".parse::<SizeClass>().unwrap(), SizeClass::Large);
        assert!("huge".parse::<SizeClass>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(AssetStatus::Active.is_terminal());
        assert!(AssetStatus::Failed.is_terminal());
        assert!(!AssetStatus::Pending.is_terminal());
        assert!(!AssetStatus::Processing.is_terminal());
    }
}
