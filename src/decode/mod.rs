//! Decoder adapters: every source format decoded to one in-memory canvas.
//!
//! Each adapter implements [`Decoder`] and hides its format library behind
//! the same contract. The [`DecoderRegistry`] picks the first registered
//! adapter that claims a detected [`MediaFormat`].
//!
//! | Format                  | Adapter          | Library                       |
//! |-------------------------|------------------|-------------------------------|
//! | JPEG, PNG, WebP, TIFF   | [`RasterDecoder`]| `image`                       |
//! | Camera RAW              | [`RawDecoder`]   | `rawloader` + half-size develop |
//! | HEIC                    | [`HeicDecoder`]  | `libheif-rs` (`heic` feature) |
//! | MP4, MOV                | [`VideoDecoder`] | `mp4` probe + `ffmpeg` frame  |
//!
//! Orientation is reported separately from the pixels and baked in by
//! [`DecodedImage::oriented`] before any resampling happens.

pub mod exif;
mod heic;
mod raster;
mod raw;
mod video;

pub use heic::HeicDecoder;
pub use raster::RasterDecoder;
pub use raw::RawDecoder;
pub use video::VideoDecoder;

use crate::budget::{Budget, BudgetExceeded};
use crate::format::MediaFormat;
use image::DynamicImage;
use image::metadata::Orientation;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Structurally broken input: truncated stream, invalid header, decoder panic.
    #[error("{0}")]
    Corrupt(String),
    /// The decode would overrun the invocation's time or memory budget.
    #[error("{0}")]
    ResourceExhausted(String),
    /// No adapter can handle this input in the current build or environment.
    #[error("{0}")]
    Unsupported(String),
}

impl From<BudgetExceeded> for DecodeError {
    fn from(e: BudgetExceeded) -> Self {
        DecodeError::ResourceExhausted(e.to_string())
    }
}

/// Output of a decoder adapter.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Pixels as stored in the file, before orientation is applied.
    pub canvas: DynamicImage,
    pub orientation: Orientation,
    /// Embedded ICC profile, carried through to the renditions.
    pub color_profile: Option<Vec<u8>>,
}

impl DecodedImage {
    pub fn new(canvas: DynamicImage) -> Self {
        Self {
            canvas,
            orientation: Orientation::NoTransforms,
            color_profile: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.canvas.width()
    }

    pub fn height(&self) -> u32 {
        self.canvas.height()
    }

    /// The canvas with its orientation baked into the pixels.
    pub fn oriented(self) -> DynamicImage {
        let mut canvas = self.canvas;
        canvas.apply_orientation(self.orientation);
        canvas
    }
}

pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, format: MediaFormat) -> bool;

    fn decode(&self, bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError>;
}

/// Ordered set of decoder adapters.
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn Decoder>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
            .register(RasterDecoder)
            .register(RawDecoder)
            .register(HeicDecoder)
            .register(VideoDecoder::default())
    }
}

impl DecoderRegistry {
    /// An empty registry. Use [`DecoderRegistry::default`] for the production set.
    pub fn new() -> Self {
        Self {
            decoders: Vec::new(),
        }
    }

    pub fn register(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    pub fn find(&self, format: MediaFormat) -> Option<&dyn Decoder> {
        self.decoders
            .iter()
            .find(|d| d.supports(format))
            .map(|d| d.as_ref())
    }

    /// Decode with the first adapter for `format`.
    ///
    /// A panic inside the adapter is reported as corrupt input.
    pub fn decode(
        &self,
        format: MediaFormat,
        bytes: &[u8],
        budget: &Budget,
    ) -> Result<DecodedImage, DecodeError> {
        let decoder = self.find(format).ok_or_else(|| {
            DecodeError::Unsupported(format!("no decoder registered for {format}"))
        })?;
        log::debug!("decoding {format} ({} bytes) with {}", bytes.len(), decoder.name());
        let decoded = catch_unwind(AssertUnwindSafe(|| decoder.decode(bytes, budget)))
            .map_err(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "decoder panicked".to_string());
                DecodeError::Corrupt(format!("{} decoder aborted: {detail}", decoder.name()))
            })??;
        budget.check_time(decoder.name())?;
        log::debug!(
            "{} decoded {}x{} in {:?}",
            decoder.name(),
            decoded.width(),
            decoded.height(),
            budget.elapsed()
        );
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    struct PanickingDecoder;

    impl Decoder for PanickingDecoder {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn supports(&self, format: MediaFormat) -> bool {
            format == MediaFormat::Raw
        }
        fn decode(&self, _bytes: &[u8], _budget: &Budget) -> Result<DecodedImage, DecodeError> {
            panic!("index out of bounds");
        }
    }

    fn budget() -> Budget {
        Budget::new(Duration::from_secs(30), 256 * 1024 * 1024, 50_000_000)
    }

    #[test]
    fn oriented_rotates_dimensions() {
        let canvas = DynamicImage::ImageRgb8(RgbImage::new(40, 20));
        let decoded = DecodedImage {
            canvas,
            orientation: Orientation::Rotate90,
            color_profile: None,
        };
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
        let oriented = decoded.oriented();
        assert_eq!((oriented.width(), oriented.height()), (20, 40));
    }

    #[test]
    fn oriented_moves_pixels() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        let decoded = DecodedImage {
            canvas: DynamicImage::ImageRgb8(img),
            orientation: Orientation::Rotate90,
            color_profile: None,
        };
        let oriented = decoded.oriented().to_rgb8();
        // Clockwise: the top-left corner lands top-right.
        assert_eq!(oriented.get_pixel(1, 0), &Rgb([255, 0, 0]));
        assert_eq!(oriented.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn default_registry_covers_every_format() {
        let registry = DecoderRegistry::default();
        for format in [
            MediaFormat::Jpeg,
            MediaFormat::Png,
            MediaFormat::Webp,
            MediaFormat::Tiff,
            MediaFormat::Heic,
            MediaFormat::Raw,
            MediaFormat::Mp4,
            MediaFormat::Mov,
        ] {
            assert!(registry.find(format).is_some(), "no decoder for {format}");
        }
    }

    #[test]
    fn first_registered_decoder_wins() {
        let registry = DecoderRegistry::new()
            .register(PanickingDecoder)
            .register(RawDecoder);
        assert_eq!(registry.find(MediaFormat::Raw).unwrap().name(), "panicking");
    }

    #[test]
    fn empty_registry_is_unsupported() {
        let err = DecoderRegistry::new()
            .decode(MediaFormat::Jpeg, &[0xFF, 0xD8, 0xFF], &budget())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported(_)));
    }

    #[test]
    fn panic_is_reported_as_corrupt() {
        let registry = DecoderRegistry::new().register(PanickingDecoder);
        let err = registry.decode(MediaFormat::Raw, b"junk", &budget()).unwrap_err();
        match err {
            DecodeError::Corrupt(msg) => assert!(msg.contains("index out of bounds"), "{msg}"),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
