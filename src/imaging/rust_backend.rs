//! Pure Rust image processing backend.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Long-edge resize | `image::DynamicImage::resize_exact` with `Lanczos3` |
//! | Thumbnail crop | `image::DynamicImage::resize_to_fill` with `Lanczos3` |
//! | Sharpening | `image::imageops::unsharpen` |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` (ICC embedded) |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |

use super::backend::{BackendError, ImageBackend};
use super::params::{EncodeParams, Fit, RenditionSpec};
use crate::types::RenditionFormat;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};

/// AVIF encoder speed: 1 (slowest, best) to 10. 6 keeps a large rendition
/// well inside the time budget.
const AVIF_SPEED: u8 = 6;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_with(
    mut encoder: impl ImageEncoder,
    image: &DynamicImage,
    params: &EncodeParams,
) -> Result<(), BackendError> {
    if let Some(icc) = &params.icc_profile
        && let Err(e) = encoder.set_icc_profile(icc.clone())
    {
        log::debug!("{} encoder dropped the ICC profile: {e}", params.format.extension());
    }
    let rgb = image.to_rgb8();
    encoder
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| {
            BackendError::EncodeFailed(format!("{} encode failed: {e}", params.format.extension()))
        })
}

impl ImageBackend for RustBackend {
    fn render(&self, source: &DynamicImage, spec: &RenditionSpec) -> Result<DynamicImage, BackendError> {
        if spec.width == 0 || spec.height == 0 {
            return Err(BackendError::ProcessingFailed(format!(
                "{} has empty target {}x{}",
                spec.class, spec.width, spec.height
            )));
        }
        let resized = match spec.fit {
            Fit::LongEdge if (source.width(), source.height()) == (spec.width, spec.height) => source.clone(),
            Fit::LongEdge => source.resize_exact(spec.width, spec.height, FilterType::Lanczos3),
            // Fill-resize then center-crop to exact dimensions
            Fit::Fill => source.resize_to_fill(spec.width, spec.height, FilterType::Lanczos3),
        };

        Ok(match spec.sharpening {
            Some(sharpening) => DynamicImage::from(image::imageops::unsharpen(
                &resized,
                sharpening.sigma,
                sharpening.threshold,
            )),
            None => resized,
        })
    }

    fn encode(&self, image: &DynamicImage, params: &EncodeParams) -> Result<Vec<u8>, BackendError> {
        let mut buf = Vec::new();
        let quality = params.quality.value().clamp(1, 100) as u8;
        match params.format {
            RenditionFormat::Jpeg => encode_with(
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality),
                image,
                params,
            )?,
            RenditionFormat::Avif => encode_with(
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, quality),
                image,
                params,
            )?,
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::params::{Quality, Sharpening};
    use crate::types::SizeClass;
    use image::{ImageDecoder, RgbImage};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn spec(class: SizeClass, width: u32, height: u32, fit: Fit) -> RenditionSpec {
        RenditionSpec {
            class,
            width,
            height,
            fit,
            sharpening: None,
            watermark: false,
        }
    }

    #[test]
    fn render_long_edge_exact_dimensions() {
        let out = RustBackend::new()
            .render(&gradient(400, 300), &spec(SizeClass::Small, 200, 150, Fit::LongEdge))
            .unwrap();
        assert_eq!((out.width(), out.height()), (200, 150));
    }

    #[test]
    fn render_fill_crops_to_target() {
        let mut s = spec(SizeClass::Thumbnail, 64, 64, Fit::Fill);
        s.sharpening = Some(Sharpening::light());
        let out = RustBackend::new().render(&gradient(300, 200), &s).unwrap();
        assert_eq!((out.width(), out.height()), (64, 64));
    }

    #[test]
    fn render_same_size_is_untouched() {
        let source = gradient(120, 80);
        let out = RustBackend::new()
            .render(&source, &spec(SizeClass::Large, 120, 80, Fit::LongEdge))
            .unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn render_rejects_empty_target() {
        let result = RustBackend::new().render(&gradient(10, 10), &spec(SizeClass::Small, 0, 10, Fit::LongEdge));
        assert!(result.is_err());
    }

    #[test]
    fn encode_jpeg_decodes_back() {
        let bytes = RustBackend::new()
            .encode(&gradient(64, 48), &EncodeParams::default())
            .unwrap();
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn encode_jpeg_embeds_icc_profile() {
        let icc = vec![7u8; 200];
        let params = EncodeParams {
            icc_profile: Some(icc.clone()),
            ..EncodeParams::default()
        };
        let bytes = RustBackend::new().encode(&gradient(32, 32), &params).unwrap();
        let mut decoder = image::codecs::jpeg::JpegDecoder::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(decoder.icc_profile().unwrap(), Some(icc));
    }

    #[test]
    fn encode_avif_produces_ftyp() {
        let params = EncodeParams {
            format: RenditionFormat::Avif,
            quality: Quality::new(60),
            icc_profile: None,
        };
        let bytes = RustBackend::new().encode(&gradient(32, 24), &params).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
    }
}
