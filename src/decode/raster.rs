//! JPEG, PNG, WebP and TIFF decoding through the `image` crate.

use super::{DecodeError, DecodedImage, Decoder, exif};
use crate::budget::Budget;
use crate::format::MediaFormat;
use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageReader};
use std::io::Cursor;

pub struct RasterDecoder;

impl Decoder for RasterDecoder {
    fn name(&self) -> &'static str {
        "raster"
    }

    fn supports(&self, format: MediaFormat) -> bool {
        image_format(format).is_some()
    }

    fn decode(&self, bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
        let Some(format) = sniff(bytes) else {
            return Err(DecodeError::Unsupported("not a raster image".into()));
        };
        verify_complete(format, bytes)?;

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(budget.image_limits());
        let mut decoder = reader.into_decoder().map_err(classify)?;

        let (width, height) = decoder.dimensions();
        budget.check_canvas(width, height, decoder.color_type().bytes_per_pixel().into())?;

        let color_profile = decoder.icc_profile().ok().flatten();
        let embedded = decoder.orientation().ok();
        let canvas = DynamicImage::from_decoder(decoder).map_err(classify)?;

        let orientation = exif::read_orientation(bytes)
            .and_then(exif::to_orientation)
            .or(embedded)
            .unwrap_or(image::metadata::Orientation::NoTransforms);

        Ok(DecodedImage {
            canvas,
            orientation,
            color_profile,
        })
    }
}

/// The registry passes only bytes, so the container is re-read from its signature.
fn sniff(bytes: &[u8]) -> Option<ImageFormat> {
    crate::format::detect(bytes, None).ok().and_then(image_format)
}

fn image_format(format: MediaFormat) -> Option<ImageFormat> {
    match format {
        MediaFormat::Jpeg => Some(ImageFormat::Jpeg),
        MediaFormat::Png => Some(ImageFormat::Png),
        MediaFormat::Webp => Some(ImageFormat::WebP),
        MediaFormat::Tiff => Some(ImageFormat::Tiff),
        _ => None,
    }
}

/// Reject streams cut short before their terminator.
///
/// The JPEG decoder pads a truncated entropy-coded segment with grey rather
/// than failing, which would publish a half-grey rendition.
fn verify_complete(format: ImageFormat, bytes: &[u8]) -> Result<(), DecodeError> {
    match format {
        ImageFormat::Jpeg => {
            let scan = exif::jpeg_segments(bytes)
                .find(|s| s.marker == 0xDA)
                .ok_or_else(|| {
                    DecodeError::Corrupt(
                        "unexpected end of file: JPEG header ends before the first scan".into(),
                    )
                })?;
            let has_eoi = bytes[scan.end..].windows(2).any(|w| w == [0xFF, 0xD9]);
            if !has_eoi {
                return Err(DecodeError::Corrupt(
                    "unexpected end of file: JPEG has no end-of-image marker".into(),
                ));
            }
            Ok(())
        }
        ImageFormat::Png => {
            let has_iend = bytes.windows(4).rev().take(64).any(|w| w == b"IEND");
            if !has_iend {
                return Err(DecodeError::Corrupt(
                    "unexpected end of file: PNG has no IEND chunk".into(),
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn classify(err: ImageError) -> DecodeError {
    match err {
        ImageError::Limits(e) => DecodeError::ResourceExhausted(e.to_string()),
        ImageError::Unsupported(e) => DecodeError::Unsupported(e.to_string()),
        ImageError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            DecodeError::Corrupt(format!("unexpected end of file: {e}"))
        }
        other => DecodeError::Corrupt(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{encode, gradient, gradient_jpeg, jpeg_with_orientation, solid_jpeg};
    use image::metadata::Orientation;
    use std::time::Duration;

    fn budget() -> Budget {
        Budget::new(Duration::from_secs(30), 256 * 1024 * 1024, 50_000_000)
    }

    #[test]
    fn decodes_jpeg() {
        let decoded = RasterDecoder.decode(&solid_jpeg(32, 16, [200, 10, 10]), &budget()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert_eq!(decoded.orientation, Orientation::NoTransforms);
    }

    #[test]
    fn decodes_png() {
        let png = encode(&gradient(10, 7), ImageFormat::Png);
        let decoded = RasterDecoder.decode(&png, &budget()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 7));
    }

    #[test]
    fn reads_exif_orientation() {
        let jpeg = jpeg_with_orientation(&gradient_jpeg(40, 20), 6);
        let decoded = RasterDecoder.decode(&jpeg, &budget()).unwrap();
        assert_eq!(decoded.orientation, Orientation::Rotate90);
        let oriented = decoded.oriented();
        assert_eq!((oriented.width(), oriented.height()), (20, 40));
    }

    #[test]
    fn truncated_jpeg_is_corrupt() {
        let jpeg = gradient_jpeg(64, 64);
        let truncated = &jpeg[..jpeg.len() / 2];
        match RasterDecoder.decode(truncated, &budget()) {
            Err(DecodeError::Corrupt(msg)) => assert!(msg.contains("end of file"), "{msg}"),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn truncated_png_is_corrupt() {
        let png = encode(&gradient(64, 64), ImageFormat::Png);
        let truncated = &png[..png.len() - 20];
        assert!(matches!(
            RasterDecoder.decode(truncated, &budget()),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[test]
    fn header_only_jpeg_is_corrupt() {
        assert!(matches!(
            RasterDecoder.decode(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00], &budget()),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[test]
    fn oversized_canvas_exhausts_budget() {
        let tight = Budget::new(Duration::from_secs(30), 256 * 1024 * 1024, 100);
        assert!(matches!(
            RasterDecoder.decode(&solid_jpeg(32, 16, [0, 0, 0]), &tight),
            Err(DecodeError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn non_raster_bytes_unsupported() {
        assert!(matches!(
            RasterDecoder.decode(b"FUJIFILMCCD-RAW 0201", &budget()),
            Err(DecodeError::Unsupported(_))
        ));
    }
}
