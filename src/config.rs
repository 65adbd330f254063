//! Pipeline configuration module.
//!
//! Handles loading and validating the worker's `config.toml`. Every section
//! and key is optional; anything left out falls back to the stock defaults
//! below. Unknown keys are rejected to catch typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! [renditions]
//! quality = 85                  # Encoder quality (1-100)
//! format = "jpeg"               # Canonical output: "jpeg" or "avif"
//! photo_classes = ["thumbnail", "small", "medium", "large"]
//! video_classes = ["thumbnail", "small", "medium", "large"]
//! thumbnail_aspect = [1, 1]     # Thumbnail centre crop, width:height
//!
//! [renditions.sizes]            # Long edge in pixels per size class
//! thumbnail = 256
//! small = 640
//! medium = 1280
//! large = 2048
//!
//! [dispatch]
//! staleness_secs = 900          # A `processing` claim older than this is reclaimed
//! max_attempts = 3              # Claims allowed before a retryable error is terminal
//!
//! [budget]
//! max_seconds = 60
//! max_memory_mb = 1024
//! max_pixels = 200000000
//!
//! [duplicates]
//! near_threshold = 0.90         # Perceptual similarity that flags a near-duplicate
//! original = "retain"           # Exact duplicates: "retain" or "discard" the new original
//!
//! [watermark]
//! mark_path = "mark.png"        # Required when any plan enables watermarking
//! opacity = 0.5
//! scale = 0.25                  # Mark width as a fraction of the rendition width
//! position = "bottom-right"
//! margin = 0.02                 # Fraction of the rendition's shorter edge
//! exempt_class = "large"        # Left unmarked when the plan grants original downloads
//!
//! [cdn]
//! base_url = "https://cdn.example.com"
//!
//! [processing]
//! max_threads = 4               # Omit for auto = CPU cores
//!
//! [capabilities]
//! default_plan = "free"
//!
//! [capabilities.plans.free]
//! watermark = true
//! max_resolution = 1280
//! original_download = false
//!
//! [capabilities.galleries]
//! "gallery-id" = "pro"
//! ```

use crate::types::{RenditionFormat, SizeClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Worker configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub renditions: RenditionsConfig,
    pub dispatch: DispatchConfig,
    pub budget: BudgetConfig,
    pub duplicates: DuplicatesConfig,
    pub watermark: WatermarkConfig,
    pub cdn: CdnConfig,
    pub processing: ProcessingConfig,
    pub capabilities: CapabilitiesConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.renditions;
        if r.quality == 0 || r.quality > 100 {
            return Err(ConfigError::Validation(
                "renditions.quality must be 1-100".into(),
            ));
        }
        if r.thumbnail_aspect[0] == 0 || r.thumbnail_aspect[1] == 0 {
            return Err(ConfigError::Validation(
                "renditions.thumbnail_aspect values must be non-zero".into(),
            ));
        }
        if r.photo_classes.is_empty() || r.video_classes.is_empty() {
            return Err(ConfigError::Validation(
                "renditions.photo_classes and renditions.video_classes must not be empty".into(),
            ));
        }
        for class in SizeClass::ALL {
            if r.sizes.long_edge(class) == 0 {
                return Err(ConfigError::Validation(format!(
                    "renditions.sizes.{class} must be non-zero"
                )));
            }
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if self.budget.max_seconds == 0 || self.budget.max_memory_mb == 0 || self.budget.max_pixels == 0 {
            return Err(ConfigError::Validation(
                "budget limits must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.duplicates.near_threshold) {
            return Err(ConfigError::Validation(
                "duplicates.near_threshold must be between 0 and 1".into(),
            ));
        }
        let w = &self.watermark;
        if !(w.opacity > 0.0 && w.opacity <= 1.0) {
            return Err(ConfigError::Validation(
                "watermark.opacity must be in (0, 1]".into(),
            ));
        }
        if !(w.scale > 0.0 && w.scale <= 1.0) {
            return Err(ConfigError::Validation(
                "watermark.scale must be in (0, 1]".into(),
            ));
        }
        if !(0.0..0.5).contains(&w.margin) {
            return Err(ConfigError::Validation(
                "watermark.margin must be in [0, 0.5)".into(),
            ));
        }
        self.capabilities.validate()
    }
}

/// Rendition sizing and encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenditionsConfig {
    /// Encoder quality (1-100).
    pub quality: u32,
    /// Canonical output encoding for every rendition.
    pub format: RenditionFormat,
    /// Size classes produced for photo sources.
    pub photo_classes: Vec<SizeClass>,
    /// Size classes produced for video poster frames.
    pub video_classes: Vec<SizeClass>,
    /// Thumbnail centre-crop aspect ratio as `[width, height]`.
    pub thumbnail_aspect: [u32; 2],
    pub sizes: SizesConfig,
}

impl Default for RenditionsConfig {
    fn default() -> Self {
        Self {
            quality: 85,
            format: RenditionFormat::Jpeg,
            photo_classes: SizeClass::ALL.to_vec(),
            video_classes: SizeClass::ALL.to_vec(),
            thumbnail_aspect: [1, 1],
            sizes: SizesConfig::default(),
        }
    }
}

/// Long-edge pixel size per size class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SizesConfig {
    pub thumbnail: u32,
    pub small: u32,
    pub medium: u32,
    pub large: u32,
}

impl Default for SizesConfig {
    fn default() -> Self {
        Self {
            thumbnail: 256,
            small: 640,
            medium: 1280,
            large: 2048,
        }
    }
}

impl SizesConfig {
    pub fn long_edge(&self, class: SizeClass) -> u32 {
        match class {
            SizeClass::Thumbnail => self.thumbnail,
            SizeClass::Small => self.small,
            SizeClass::Medium => self.medium,
            SizeClass::Large => self.large,
        }
    }
}

/// Idempotency and retry settings for the dispatch layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub staleness_secs: u64,
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 900,
            max_attempts: 3,
        }
    }
}

impl DispatchConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

/// Per-invocation resource budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub max_seconds: u64,
    pub max_memory_mb: u64,
    pub max_pixels: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_seconds: 60,
            max_memory_mb: 1024,
            max_pixels: 200_000_000,
        }
    }
}

/// What happens to the new upload's original when it is a byte-identical duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginalPolicy {
    #[default]
    Retain,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DuplicatesConfig {
    pub near_threshold: f64,
    pub original: OriginalPolicy,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            near_threshold: 0.90,
            original: OriginalPolicy::Retain,
        }
    }
}

/// Corner (or centre) the watermark is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkConfig {
    /// PNG mark composited onto renditions. Required for watermarking plans.
    pub mark_path: Option<PathBuf>,
    pub opacity: f32,
    pub scale: f32,
    pub position: WatermarkPosition,
    pub margin: f32,
    /// Class left unmarked when the plan grants original-quality downloads.
    pub exempt_class: SizeClass,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            mark_path: None,
            opacity: 0.5,
            scale: 0.25,
            position: WatermarkPosition::BottomRight,
            margin: 0.02,
            exempt_class: SizeClass::Large,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CdnConfig {
    pub base_url: String,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cdn.example.com".to_string(),
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of rayon worker threads.
    /// When absent or null, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_threads: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_threads
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// Feature set granted by a plan tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanConfig {
    pub watermark: bool,
    /// Long-edge cap applied to every size class.
    pub max_resolution: Option<u32>,
    pub original_download: bool,
}

/// Static plan table backing the capability query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilitiesConfig {
    pub default_plan: String,
    pub plans: BTreeMap<String, PlanConfig>,
    /// Gallery id → plan name. Galleries not listed use `default_plan`.
    pub galleries: BTreeMap<String, String>,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        let mut plans = BTreeMap::new();
        plans.insert(
            "free".to_string(),
            PlanConfig {
                watermark: false,
                max_resolution: None,
                original_download: false,
            },
        );
        Self {
            default_plan: "free".to_string(),
            plans,
            galleries: BTreeMap::new(),
        }
    }
}

impl CapabilitiesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.plans.contains_key(&self.default_plan) {
            return Err(ConfigError::Validation(format!(
                "capabilities.default_plan '{}' is not defined in capabilities.plans",
                self.default_plan
            )));
        }
        for (gallery, plan) in &self.galleries {
            if !self.plans.contains_key(plan) {
                return Err(ConfigError::Validation(format!(
                    "capabilities.galleries.{gallery} refers to unknown plan '{plan}'"
                )));
            }
        }
        if self.plans.values().any(|p| p.max_resolution == Some(0)) {
            return Err(ConfigError::Validation(
                "capabilities.plans.*.max_resolution must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn any_plan_watermarks(&self) -> bool {
        self.plans.values().any(|p| p.watermark)
    }
}

/// Parse a config document and validate it.
pub fn parse_config(content: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load config from a file, or return stock defaults when no path is given.
///
/// A relative `watermark.mark_path` is resolved against the config file's
/// directory.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let Some(path) = path else {
        let config = PipelineConfig::default();
        config.validate()?;
        return Ok(config);
    };
    let content = fs::read_to_string(path)?;
    let mut config = parse_config(&content)?;
    if let Some(mark) = &config.watermark.mark_path
        && mark.is_relative()
        && let Some(dir) = path.parent()
    {
        config.watermark.mark_path = Some(dir.join(mark));
    }
    Ok(config)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# gallery-renditions configuration
# ==================================
#
# Every key is optional. Values shown are the stock defaults.
# Unknown keys are rejected.

# ---------------------------------------------------------------------------
# Renditions
# ---------------------------------------------------------------------------
[renditions]
# Encoder quality, 1-100.
quality = 85

# Canonical output encoding for every rendition: "jpeg" or "avif".
format = "jpeg"

# Size classes produced for photos and for video poster frames.
photo_classes = ["thumbnail", "small", "medium", "large"]
video_classes = ["thumbnail", "small", "medium", "large"]

# Thumbnails are centre-cropped to this aspect ratio, [width, height].
thumbnail_aspect = [1, 1]

# Long edge in pixels for each size class. Sources smaller than a class are
# never upscaled.
[renditions.sizes]
thumbnail = 256
small = 640
medium = 1280
large = 2048

# ---------------------------------------------------------------------------
# Dispatch
# ---------------------------------------------------------------------------
[dispatch]
# A `processing` claim older than this many seconds is treated as a crashed
# attempt and reclaimed by the next delivery of its event.
staleness_secs = 900

# Claims allowed per asset. A retryable failure on the last attempt is
# recorded as a terminal failure.
max_attempts = 3

# ---------------------------------------------------------------------------
# Per-invocation budget
# ---------------------------------------------------------------------------
[budget]
max_seconds = 60
max_memory_mb = 1024
max_pixels = 200000000

# ---------------------------------------------------------------------------
# Duplicates
# ---------------------------------------------------------------------------
[duplicates]
# Perceptual similarity (0-1) at which an upload is flagged as a possible
# near-duplicate for the uploader to confirm. Never merged automatically.
near_threshold = 0.90

# Byte-identical re-uploads share the existing renditions. "retain" keeps the
# new upload's original for downloads, "discard" deletes it.
original = "retain"

# ---------------------------------------------------------------------------
# Watermark
# ---------------------------------------------------------------------------
[watermark]
# PNG with alpha. Required when any plan enables watermarking.
# mark_path = "mark.png"
opacity = 0.5
# Mark width as a fraction of the rendition width.
scale = 0.25
# "top-left", "top-right", "bottom-left", "bottom-right" or "center".
position = "bottom-right"
# Inset as a fraction of the rendition's shorter edge.
margin = 0.02
# Left unmarked only when the plan grants original-quality downloads.
exempt_class = "large"

# ---------------------------------------------------------------------------
# CDN
# ---------------------------------------------------------------------------
[cdn]
base_url = "https://cdn.example.com"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum rayon worker threads. Omit to use all CPU cores.
# max_threads = 4

# ---------------------------------------------------------------------------
# Capabilities (plan tiers)
# ---------------------------------------------------------------------------
[capabilities]
default_plan = "free"

[capabilities.plans.free]
watermark = false
# max_resolution = 1280
original_download = false

# Gallery id to plan name.
[capabilities.galleries]
"##
}
