//! Content-based format detection.
//!
//! Uploads are classified by magic bytes and container signatures, never by
//! extension alone: phones routinely export HEIC with a `.jpg` name and some
//! camera tools write RAW files with a generic `.tif`. The declared extension
//! is consulted only to split plain TIFF from TIFF-based RAW containers that
//! carry no distinguishing marker.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bytes of the original that detection looks at.
pub const DETECT_PREFIX_LEN: usize = 64;

/// Extensions of TIFF-based and proprietary camera RAW containers.
pub const RAW_EXTENSIONS: &[&str] = &[
    "3fr", "arw", "cr2", "cr3", "crw", "dcr", "dng", "erf", "iiq", "k25", "kdc", "mef", "mos",
    "mrw", "nef", "nrw", "orf", "pef", "raf", "rw2", "rwl", "sr2", "srf", "srw", "x3f",
];

const HEIC_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];
const MP4_BRANDS: &[&[u8; 4]] = &[
    b"isom", b"iso2", b"iso4", b"iso5", b"iso6", b"mp41", b"mp42", b"avc1", b"M4V ", b"M4VP",
    b"dash", b"3gp4", b"3gp5",
];
const AVIF_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis"];

/// Closed set of source formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Jpeg,
    Png,
    Webp,
    Tiff,
    Heic,
    Raw,
    Mp4,
    Mov,
}

/// Whether an asset is a still photo or a video (which gets poster-frame renditions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Photo,
    Video,
}

impl MediaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Tiff => "tiff",
            Self::Heic => "heic",
            Self::Raw => "raw",
            Self::Mp4 => "mp4",
            Self::Mov => "mov",
        }
    }

    pub fn content_type(self) -> ContentType {
        match self {
            Self::Mp4 | Self::Mov => ContentType::Video,
            _ => ContentType::Photo,
        }
    }

    /// Formats a declared extension usually stands for. Used only to log mismatches.
    fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "jpe" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "tif" | "tiff" => Some(Self::Tiff),
            "heic" | "heif" | "hif" => Some(Self::Heic),
            "mp4" | "m4v" => Some(Self::Mp4),
            "mov" | "qt" => Some(Self::Mov),
            e if RAW_EXTENSIONS.contains(&e) => Some(Self::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct UnsupportedFormat(pub String);

/// Classify an original by its leading bytes.
///
/// `declared_extension` breaks the tie between plain TIFF and TIFF-based RAW
/// containers; it never overrides a signature match.
pub fn detect(bytes: &[u8], declared_extension: Option<&str>) -> Result<MediaFormat, UnsupportedFormat> {
    let prefix = &bytes[..bytes.len().min(DETECT_PREFIX_LEN)];
    let detected = detect_signature(prefix, declared_extension)?;

    if let Some(ext) = declared_extension
        && let Some(claimed) = MediaFormat::from_extension(ext)
        && claimed != detected
    {
        log::debug!("declared extension .{ext} suggests {claimed}, content is {detected}");
    }
    Ok(detected)
}

fn detect_signature(
    prefix: &[u8],
    declared_extension: Option<&str>,
) -> Result<MediaFormat, UnsupportedFormat> {
    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok(MediaFormat::Jpeg);
    }
    if prefix.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Ok(MediaFormat::Png);
    }
    if prefix.len() >= 12 && &prefix[0..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
        return Ok(MediaFormat::Webp);
    }
    if prefix.starts_with(b"FUJIFILMCCD-RAW") {
        return Ok(MediaFormat::Raw);
    }
    if prefix.len() >= 8 && &prefix[4..8] == b"ftyp" {
        return classify_ftyp(prefix);
    }
    // QuickTime files predating `ftyp` open straight with a movie atom.
    if prefix.len() >= 8 && matches!(&prefix[4..8], b"moov" | b"mdat" | b"wide" | b"free" | b"pnot") {
        return Ok(MediaFormat::Mov);
    }
    // TIFF variants with a vendor magic in place of 42.
    if prefix.starts_with(b"IIRO") || prefix.starts_with(b"IIRS") || prefix.starts_with(b"MMOR") {
        return Ok(MediaFormat::Raw);
    }
    if prefix.starts_with(b"IIU\0") {
        return Ok(MediaFormat::Raw);
    }
    if prefix.starts_with(b"II*\0") || prefix.starts_with(b"MM\0*") {
        if prefix.len() >= 10 && &prefix[8..10] == b"CR" {
            return Ok(MediaFormat::Raw);
        }
        let raw_ext = declared_extension
            .map(|e| RAW_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        return Ok(if raw_ext { MediaFormat::Raw } else { MediaFormat::Tiff });
    }

    Err(UnsupportedFormat(format!(
        "unrecognised file signature {}",
        hex_preview(prefix)
    )))
}

/// Classify an ISO base media file by its major and compatible brands.
fn classify_ftyp(prefix: &[u8]) -> Result<MediaFormat, UnsupportedFormat> {
    let major: [u8; 4] = prefix[8..12.min(prefix.len())]
        .try_into()
        .map_err(|_| UnsupportedFormat("truncated ftyp box".into()))?;

    let box_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let end = box_len.clamp(16, prefix.len().max(16)).min(prefix.len());
    let compatible: Vec<[u8; 4]> = prefix
        .get(16..end)
        .unwrap_or(&[])
        .chunks_exact(4)
        .filter_map(|c| c.try_into().ok())
        .collect();

    // A generic image-file major brand defers to its compatible brands for AVIF.
    if matches!(&major, b"mif1" | b"msf1") && compatible.iter().any(|b| AVIF_BRANDS.contains(&b)) {
        return Err(UnsupportedFormat("AVIF sources are not supported".into()));
    }
    if let Some(format) = classify_brand(&major)? {
        return Ok(format);
    }
    for brand in &compatible {
        if let Some(format) = classify_brand(brand)? {
            return Ok(format);
        }
    }
    Err(UnsupportedFormat(format!(
        "unsupported ISO media brand '{}'",
        String::from_utf8_lossy(&major)
    )))
}

fn classify_brand(brand: &[u8; 4]) -> Result<Option<MediaFormat>, UnsupportedFormat> {
    if AVIF_BRANDS.contains(&brand) {
        return Err(UnsupportedFormat("AVIF sources are not supported".into()));
    }
    if brand == b"crx " {
        return Ok(Some(MediaFormat::Raw));
    }
    if HEIC_BRANDS.contains(&brand) {
        return Ok(Some(MediaFormat::Heic));
    }
    if brand == b"qt  " {
        return Ok(Some(MediaFormat::Mov));
    }
    if MP4_BRANDS.contains(&brand) {
        return Ok(Some(MediaFormat::Mp4));
    }
    Ok(None)
}

fn hex_preview(prefix: &[u8]) -> String {
    if prefix.is_empty() {
        return "(empty file)".to_string();
    }
    prefix
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
