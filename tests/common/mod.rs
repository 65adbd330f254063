//! Shared scaffolding for the pipeline scenarios.
//!
//! Everything runs against the in-memory stores and a manual clock, with
//! small size classes so each scenario encodes only a few kilobytes.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use gallery_renditions::budget::Budget;
use gallery_renditions::capability::StaticCapabilities;
use gallery_renditions::clock::ManualClock;
use gallery_renditions::config::{PipelineConfig, SizesConfig};
use gallery_renditions::decode::{DecodeError, DecodedImage, Decoder};
use gallery_renditions::dispatch::Dispatcher;
use gallery_renditions::format::MediaFormat;
use gallery_renditions::gallery::Gallery;
use gallery_renditions::imaging::{BackendError, EncodeParams, ImageBackend, RenditionSpec, RustBackend};
use gallery_renditions::storage::{MemoryObjectStore, ObjectStore, StorageError};
use gallery_renditions::store::{MemoryStore, MetadataStore, StoreError, Versioned, WriteOutcome};
use gallery_renditions::types::{Asset, IngressEvent, SizeClass};
use image::metadata::Orientation;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

pub const BUCKET: &str = "uploads";

pub fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Stock config with size classes of 32/64/128/256.
pub fn small_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.renditions.sizes = SizesConfig {
        thumbnail: 32,
        small: 64,
        medium: 128,
        large: 256,
    };
    config.cdn.base_url = "https://cdn.test".into();
    config
}

pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            objects: Arc::new(MemoryObjectStore::new()),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(start())),
            config,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_over(self.objects.clone())
    }

    /// A dispatcher writing through `objects` instead of the harness store.
    pub fn dispatcher_over(&self, objects: Arc<dyn ObjectStore>) -> Dispatcher {
        self.assemble(objects, self.store.clone())
    }

    /// A dispatcher keeping its records in `store`.
    pub fn dispatcher_on(&self, store: Arc<dyn MetadataStore>) -> Dispatcher {
        self.assemble(self.objects.clone(), store)
    }

    fn assemble(&self, objects: Arc<dyn ObjectStore>, store: Arc<dyn MetadataStore>) -> Dispatcher {
        let capabilities = Arc::new(StaticCapabilities::new(self.config.capabilities.clone()));
        Dispatcher::new(self.config.clone(), objects, store, capabilities)
            .with_clock(self.clock.clone())
            .with_bucket(BUCKET)
    }

    pub fn gallery(&self) -> Gallery {
        Gallery::new(
            self.store.clone(),
            self.objects.clone(),
            self.clock.clone(),
            &self.config.dispatch,
        )
    }

    /// Put an original in place and return the event its upload produces.
    pub fn upload(&self, gallery_id: &str, asset_id: &str, filename: &str, bytes: &[u8]) -> IngressEvent {
        let key = format!("originals/{gallery_id}/{asset_id}/{filename}");
        self.objects.put(&key, bytes).unwrap();
        IngressEvent {
            bucket_name: BUCKET.into(),
            object_key: key,
            size: bytes.len() as u64,
        }
    }

    pub fn asset(&self, id: &str) -> Asset {
        self.store
            .get_asset(id)
            .unwrap()
            .unwrap_or_else(|| panic!("no record for asset {id}"))
            .value
    }

    pub fn rendition_keys(&self) -> Vec<String> {
        self.objects.keys_with_prefix("renditions/")
    }

    /// Decode the stored rendition of `class` for `asset`.
    pub fn rendition_image(&self, asset: &Asset, class: SizeClass) -> DynamicImage {
        let rendition = asset
            .rendition(class)
            .unwrap_or_else(|| panic!("asset {} has no {class} rendition", asset.id));
        image::load_from_memory(&self.objects.get(&rendition.key).unwrap()).unwrap()
    }
}

// =========================================================================
// Image fixtures
// =========================================================================

pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

pub fn gradient(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / (width - 1)) as u8;
        let g = (y * 255 / (height - 1)) as u8;
        Rgb([r, g, 64])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn gradient_jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

pub fn solid_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    encode(
        &DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb))),
        ImageFormat::Jpeg,
    )
}

/// Splice a big-endian EXIF APP1 segment carrying `orientation` after SOI.
pub fn jpeg_with_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
    let mut tiff = b"MM\0\x2a\0\0\0\x08".to_vec();
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    let mut payload = b"Exif\0\0".to_vec();
    payload.extend_from_slice(&tiff);
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE1];
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

/// Mean luma of a `size`-pixel square centred on `(x, y)`.
pub fn luma_around(img: &DynamicImage, x: u32, y: u32, size: u32) -> f64 {
    let luma = img.to_luma8();
    let half = size / 2;
    let mut sum = 0u64;
    let mut n = 0u64;
    for yy in y - half..y - half + size {
        for xx in x - half..x - half + size {
            sum += u64::from(luma.get_pixel(xx, yy)[0]);
            n += 1;
        }
    }
    sum as f64 / n as f64
}

/// Bytes the detector classifies as RAW when declared as `.nef`.
pub fn tiff_container() -> Vec<u8> {
    let mut bytes = b"II*\0\x08\0\0\0".to_vec();
    bytes.resize(64, 0);
    bytes
}

// =========================================================================
// Test doubles
// =========================================================================

/// RAW adapter stand-in: returns a fixed landscape canvas tagged with
/// EXIF orientation 6, as a camera held upright would.
pub struct StubRawDecoder {
    pub width: u32,
    pub height: u32,
}

impl Decoder for StubRawDecoder {
    fn name(&self) -> &'static str {
        "stub-raw"
    }

    fn supports(&self, format: MediaFormat) -> bool {
        format == MediaFormat::Raw
    }

    fn decode(&self, _bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
        budget.check_canvas(self.width, self.height, 3)?;
        let mut decoded = DecodedImage::new(gradient(self.width, self.height));
        decoded.orientation = Orientation::Rotate90;
        Ok(decoded)
    }
}

/// The production backend, except rendering `class` always fails.
pub struct FailingBackend {
    pub class: SizeClass,
}

impl ImageBackend for FailingBackend {
    fn render(&self, source: &DynamicImage, spec: &RenditionSpec) -> Result<DynamicImage, BackendError> {
        if spec.class == self.class {
            return Err(BackendError::EncodeFailed(format!("{} encoder crashed", spec.class)));
        }
        RustBackend::new().render(source, spec)
    }

    fn encode(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, BackendError> {
        RustBackend::new().encode(image, params)
    }
}

/// Object store whose `put` fails for keys ending in `suffix`.
pub struct FailingPuts {
    pub inner: Arc<MemoryObjectStore>,
    pub suffix: &'static str,
}

impl ObjectStore for FailingPuts {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if key.ends_with(self.suffix) {
            return Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.put(key, bytes)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key)
    }
}

type Interleave = Box<dyn FnOnce() + Send>;

/// Metadata store that runs `before` once, ahead of the first asset update
/// matching `when`. Lets a scenario slot another actor between two steps
/// of a dispatch.
pub struct InterleavedStore {
    pub inner: Arc<MemoryStore>,
    when: Box<dyn Fn(&Asset) -> bool + Send + Sync>,
    before: Mutex<Option<Interleave>>,
}

impl InterleavedStore {
    pub fn new(
        inner: Arc<MemoryStore>,
        when: impl Fn(&Asset) -> bool + Send + Sync + 'static,
        before: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            inner,
            when: Box::new(when),
            before: Mutex::new(Some(Box::new(before))),
        }
    }

    pub fn fired(&self) -> bool {
        self.before.lock().unwrap().is_none()
    }
}

impl MetadataStore for InterleavedStore {
    fn get_asset(&self, id: &str) -> Result<Option<Versioned<Asset>>, StoreError> {
        self.inner.get_asset(id)
    }

    fn create_asset(&self, asset: &Asset) -> Result<WriteOutcome, StoreError> {
        self.inner.create_asset(asset)
    }

    fn update_asset(&self, asset: &Asset, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        if (self.when)(asset) {
            let hook = self.before.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.update_asset(asset, expected_version)
    }

    fn delete_asset(&self, id: &str, expected_version: u64) -> Result<WriteOutcome, StoreError> {
        self.inner.delete_asset(id, expected_version)
    }

    fn list_gallery(&self, gallery_id: &str) -> Result<Vec<Asset>, StoreError> {
        self.inner.list_gallery(gallery_id)
    }

    fn insert_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str) -> Result<WriteOutcome, StoreError> {
        self.inner.insert_fingerprint(gallery_id, fingerprint, asset_id)
    }

    fn lookup_fingerprint(&self, gallery_id: &str, fingerprint: &str) -> Result<Option<String>, StoreError> {
        self.inner.lookup_fingerprint(gallery_id, fingerprint)
    }

    fn repoint_fingerprint(
        &self,
        gallery_id: &str,
        fingerprint: &str,
        from: &str,
        to: &str,
    ) -> Result<WriteOutcome, StoreError> {
        self.inner.repoint_fingerprint(gallery_id, fingerprint, from, to)
    }

    fn remove_fingerprint(&self, gallery_id: &str, fingerprint: &str, asset_id: &str) -> Result<(), StoreError> {
        self.inner.remove_fingerprint(gallery_id, fingerprint, asset_id)
    }

    fn put_ephemeral(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.put_ephemeral(key, value, expires_at)
    }

    fn get_ephemeral(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        self.inner.get_ephemeral(key, now)
    }

    fn count_ephemeral(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.count_ephemeral(prefix, now)
    }
}
