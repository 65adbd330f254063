//! Minimal EXIF orientation reader.
//!
//! Extracts tag 0x0112 (Orientation) from IFD0 of the embedded TIFF
//! structure, wherever the container keeps it:
//! - JPEG: APP1 segment starting with `Exif\0\0`
//! - PNG: `eXIf` chunk
//! - WebP: `EXIF` RIFF chunk
//! - TIFF and TIFF-based RAW: the file itself
//!
//! Every read is bounds-checked; malformed metadata yields `None` rather
//! than an error because orientation is advisory.

use image::metadata::Orientation;

const ORIENTATION_TAG: u16 = 0x0112;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Raw EXIF orientation value (1-8) found in `data`, if any.
pub fn read_orientation(data: &[u8]) -> Option<u16> {
    if data.starts_with(&[0xFF, 0xD8]) {
        return find_jpeg_exif(data).and_then(orientation_from_tiff);
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return find_png_exif(data).and_then(orientation_from_tiff);
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return find_webp_exif(data).and_then(orientation_from_tiff);
    }
    orientation_from_tiff(data)
}

/// Map an EXIF orientation value to the transform that displays the image upright.
pub fn to_orientation(value: u16) -> Option<Orientation> {
    u8::try_from(value).ok().and_then(Orientation::from_exif)
}

// ---------------------------------------------------------------------------
// JPEG segments
// ---------------------------------------------------------------------------

/// One marker segment of a JPEG header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JpegSegment<'a> {
    pub marker: u8,
    pub payload: &'a [u8],
    /// Offset of the first byte after this segment.
    pub end: usize,
}

/// Walk JPEG marker segments from SOI up to and including SOS.
pub(crate) fn jpeg_segments(data: &[u8]) -> impl Iterator<Item = JpegSegment<'_>> {
    let mut pos = 2;
    let mut done = !data.starts_with(&[0xFF, 0xD8]);
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        // Fill bytes may precede a marker.
        while data.get(pos) == Some(&0xFF) && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if data.get(pos) != Some(&0xFF) {
            done = true;
            return None;
        }
        let marker = *data.get(pos + 1)?;
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            pos += 2;
            return Some(JpegSegment {
                marker,
                payload: &[],
                end: pos,
            });
        }
        let len = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]) as usize;
        if len < 2 {
            done = true;
            return None;
        }
        let start = pos + 4;
        let end = pos + 2 + len;
        let Some(payload) = data.get(start..end) else {
            done = true;
            return None;
        };
        pos = end;
        if marker == 0xDA {
            done = true;
        }
        Some(JpegSegment {
            marker,
            payload,
            end,
        })
    })
}

fn find_jpeg_exif(data: &[u8]) -> Option<&[u8]> {
    jpeg_segments(data)
        .find(|s| s.marker == 0xE1 && s.payload.starts_with(EXIF_HEADER))
        .map(|s| &s.payload[EXIF_HEADER.len()..])
}

// ---------------------------------------------------------------------------
// PNG and WebP chunks
// ---------------------------------------------------------------------------

fn find_png_exif(data: &[u8]) -> Option<&[u8]> {
    let mut pos = 8;
    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().ok()?) as usize;
        let kind = &data[pos + 4..pos + 8];
        let body = data.get(pos + 8..pos + 8 + len)?;
        if kind == b"eXIf" {
            // Some writers keep the JPEG-style header.
            return Some(body.strip_prefix(EXIF_HEADER).unwrap_or(body));
        }
        if kind == b"IDAT" || kind == b"IEND" {
            return None;
        }
        pos += 12 + len;
    }
    None
}

fn find_webp_exif(data: &[u8]) -> Option<&[u8]> {
    let mut pos = 12;
    while pos + 8 <= data.len() {
        let kind = &data[pos..pos + 4];
        let len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().ok()?) as usize;
        let body = data.get(pos + 8..pos + 8 + len)?;
        if kind == b"EXIF" {
            return Some(body.strip_prefix(EXIF_HEADER).unwrap_or(body));
        }
        // Chunks are padded to even length.
        pos += 8 + len + (len % 2);
    }
    None
}

// ---------------------------------------------------------------------------
// TIFF IFD0
// ---------------------------------------------------------------------------

/// Find the orientation tag in IFD0 of a TIFF structure.
pub fn orientation_from_tiff(data: &[u8]) -> Option<u16> {
    let big_endian = match data.get(0..2)? {
        b"MM" => true,
        b"II" => false,
        _ => return None,
    };

    let read_u16 = |offset: usize| -> Option<u16> {
        let b: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
        Some(if big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    };
    let read_u32 = |offset: usize| -> Option<u32> {
        let b: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
        Some(if big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    };

    // 42 for TIFF; ORF and RW2 use vendor magics with the same layout.
    let magic = read_u16(2)?;
    if !matches!(magic, 42 | 0x4F52 | 0x5352 | 0x0055) {
        return None;
    }

    let ifd = read_u32(4)? as usize;
    let count = read_u16(ifd)? as usize;
    (0..count).find_map(|i| {
        let entry = ifd + 2 + i * 12;
        if read_u16(entry)? != ORIENTATION_TAG {
            return None;
        }
        // SHORT, count 1: the value sits left-aligned in the offset field.
        if read_u16(entry + 2)? != 3 {
            return None;
        }
        let value = read_u16(entry + 8)?;
        (1..=8).contains(&value).then_some(value)
    })
}
