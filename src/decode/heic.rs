//! HEIC decoding.
//!
//! There is no pure-Rust HEVC decoder, so pixel decoding links the system
//! libheif and is only compiled with the `heic` feature. The container walk
//! that reads the declared dimensions is always available, so oversized
//! images are rejected against the budget before libheif allocates anything.

use super::{DecodeError, DecodedImage, Decoder};
use crate::budget::Budget;
use crate::format::MediaFormat;

pub struct HeicDecoder;

impl Decoder for HeicDecoder {
    fn name(&self) -> &'static str {
        "heic"
    }

    fn supports(&self, format: MediaFormat) -> bool {
        format == MediaFormat::Heic
    }

    fn decode(&self, bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
        let (width, height) = declared_dimensions(bytes).ok_or_else(|| {
            DecodeError::Corrupt("HEIC container has no image spatial extents".into())
        })?;
        budget.check_canvas(width, height, 3)?;
        decode_pixels(bytes, budget)
    }
}

#[cfg(feature = "heic")]
fn decode_pixels(bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
    use image::{DynamicImage, RgbImage};
    use libheif_rs::{ColorSpace, HeifContext, HeifErrorCode, LibHeif, RgbChroma};

    let classify = |e: libheif_rs::HeifError| {
        if matches!(e.code, HeifErrorCode::MemoryAllocationError) {
            DecodeError::ResourceExhausted(e.to_string())
        } else {
            DecodeError::Corrupt(e.to_string())
        }
    };

    let lib = LibHeif::new();
    let ctx = HeifContext::read_from_bytes(bytes).map_err(classify)?;
    let handle = ctx.primary_image_handle().map_err(classify)?;
    budget.check_canvas(handle.width(), handle.height(), 3)?;
    let color_profile = handle.color_profile_raw().map(|p| p.data);

    // libheif applies the container's rotation and mirror transforms itself.
    let image = lib
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(classify)?;
    budget.check_time("heic decode")?;

    let planes = image.planes();
    let plane = planes
        .interleaved
        .ok_or_else(|| DecodeError::Corrupt("HEIC decode produced no interleaved plane".into()))?;
    let row_bytes = plane.width as usize * 3;
    let mut pixels = Vec::with_capacity(row_bytes * plane.height as usize);
    for row in plane.data.chunks(plane.stride).take(plane.height as usize) {
        pixels.extend_from_slice(row.get(..row_bytes).ok_or_else(|| {
            DecodeError::Corrupt("HEIC plane row shorter than its width".into())
        })?);
    }
    let canvas = RgbImage::from_raw(plane.width, plane.height, pixels)
        .ok_or_else(|| DecodeError::Corrupt("HEIC plane size mismatch".into()))?;

    Ok(DecodedImage {
        canvas: DynamicImage::ImageRgb8(canvas),
        orientation: image::metadata::Orientation::NoTransforms,
        color_profile,
    })
}

#[cfg(not(feature = "heic"))]
fn decode_pixels(_bytes: &[u8], _budget: &Budget) -> Result<DecodedImage, DecodeError> {
    Err(DecodeError::Unsupported(
        "HEIC decoding not compiled in (build with the `heic` feature)".into(),
    ))
}

/// Largest `ispe` (image spatial extents) property in the `meta` box.
///
/// Grid images list one `ispe` per tile plus one for the full canvas, so
/// the largest is the primary image.
pub(crate) fn declared_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let meta = find_box(bytes, b"meta")?;
    // `meta` is a full box: version and flags precede its children.
    let iprp = find_box(meta.get(4..)?, b"iprp")?;
    let ipco = find_box(iprp, b"ipco")?;
    boxes(ipco)
        .filter(|(kind, _)| kind == b"ispe")
        .filter_map(|(_, body)| {
            let w = u32::from_be_bytes(body.get(4..8)?.try_into().ok()?);
            let h = u32::from_be_bytes(body.get(8..12)?.try_into().ok()?);
            Some((w, h))
        })
        .filter(|&(w, h)| w > 0 && h > 0)
        .max_by_key(|&(w, h)| u64::from(w) * u64::from(h))
}

fn find_box<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    boxes(data).find(|(k, _)| k == kind).map(|(_, body)| body)
}

/// Iterate ISO-BMFF boxes as `(type, body)` pairs.
fn boxes(data: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        let header = data.get(pos..pos + 8)?;
        let size32 = u32::from_be_bytes(header[0..4].try_into().ok()?) as usize;
        let kind: [u8; 4] = header[4..8].try_into().ok()?;
        let (header_len, size) = match size32 {
            0 => (8, data.len() - pos),
            1 => {
                let large = data.get(pos + 8..pos + 16)?;
                (16, usize::try_from(u64::from_be_bytes(large.try_into().ok()?)).ok()?)
            }
            n => (8, n),
        };
        if size < header_len {
            return None;
        }
        let end = pos.checked_add(size)?;
        let body = data.get(pos + header_len..end)?;
        pos = end;
        Some((kind, body))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bmff_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        out
    }

    fn ispe(w: u32, h: u32) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&w.to_be_bytes());
        body.extend_from_slice(&h.to_be_bytes());
        bmff_box(b"ispe", &body)
    }

    fn heic_with_extents(extents: &[(u32, u32)]) -> Vec<u8> {
        let props: Vec<u8> = extents.iter().flat_map(|&(w, h)| ispe(w, h)).collect();
        let ipco = bmff_box(b"ipco", &props);
        let iprp = bmff_box(b"iprp", &ipco);
        let mut meta_body = vec![0, 0, 0, 0];
        meta_body.extend_from_slice(&bmff_box(b"hdlr", &[0; 24]));
        meta_body.extend_from_slice(&iprp);

        let mut file = bmff_box(b"ftyp", b"heic\0\0\0\0mif1heic");
        file.extend_from_slice(&bmff_box(b"meta", &meta_body));
        file.extend_from_slice(&bmff_box(b"mdat", &[0; 16]));
        file
    }

    #[test]
    fn reads_primary_extents() {
        let file = heic_with_extents(&[(512, 512), (4032, 3024), (512, 512)]);
        assert_eq!(declared_dimensions(&file), Some((4032, 3024)));
    }

    #[test]
    fn missing_meta_is_none() {
        let file = bmff_box(b"ftyp", b"heic\0\0\0\0mif1");
        assert_eq!(declared_dimensions(&file), None);
    }

    #[test]
    fn truncated_box_is_none() {
        let file = heic_with_extents(&[(100, 100)]);
        assert_eq!(declared_dimensions(&file[..30]), None);
    }

    #[test]
    fn oversized_heic_exhausts_budget_before_decoding() {
        let file = heic_with_extents(&[(20_000, 20_000)]);
        let budget = Budget::new(Duration::from_secs(10), 64 * 1024 * 1024, 50_000_000);
        assert!(matches!(
            HeicDecoder.decode(&file, &budget),
            Err(DecodeError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn container_without_extents_is_corrupt() {
        let file = bmff_box(b"ftyp", b"heic\0\0\0\0mif1");
        let budget = Budget::new(Duration::from_secs(10), u64::MAX, u64::MAX);
        assert!(matches!(
            HeicDecoder.decode(&file, &budget),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[cfg(not(feature = "heic"))]
    #[test]
    fn without_feature_heic_is_unsupported() {
        let file = heic_with_extents(&[(640, 480)]);
        let budget = Budget::new(Duration::from_secs(10), u64::MAX, u64::MAX);
        match HeicDecoder.decode(&file, &budget) {
            Err(DecodeError::Unsupported(msg)) => assert!(msg.contains("not compiled in")),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
