//! Parameter types for rendition work.
//!
//! These describe *what* to produce, not *how*. The generator plans a
//! [`RenditionSpec`] per size class; the [`backend`](super::backend) does
//! the pixel work. Swapping the backend (e.g. for a recording mock in
//! tests) leaves planning untouched.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 85). Clamped on construction.
//! - [`Sharpening`]: Unsharp-mask parameters applied to thumbnails.
//! - [`Fit`]: Long-edge fit or fill-and-centre-crop.
//! - [`RenditionSpec`]: One size class: output dimensions, fit, sharpening, watermark.
//! - [`EncodeParams`]: Output format, quality and the ICC profile to embed.

use crate::types::{RenditionFormat, SizeClass};

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(85)
    }
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Light sharpening suitable for thumbnails.
    pub fn light() -> Self {
        Self {
            sigma: 0.5,
            threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Scale so the long edge equals the target; aspect preserved.
    LongEdge,
    /// Scale to cover the target, then centre-crop to it exactly.
    Fill,
}

/// Everything needed to render one size class from the oriented canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionSpec {
    pub class: SizeClass,
    pub width: u32,
    pub height: u32,
    pub fit: Fit,
    pub sharpening: Option<Sharpening>,
    pub watermark: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeParams {
    pub format: RenditionFormat,
    pub quality: Quality,
    /// Source ICC profile, embedded when the encoder supports it.
    pub icc_profile: Option<Vec<u8>>,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            format: RenditionFormat::Jpeg,
            quality: Quality::default(),
            icc_profile: None,
        }
    }
}
