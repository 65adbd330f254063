//! Watermark compositor.
//!
//! The mark is loaded once per process and composited onto every rendition
//! the plan requires. It is scaled relative to each rendition's width so it
//! reads the same on a thumbnail and on the large size.

use crate::config::{WatermarkConfig, WatermarkPosition};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("watermark required but no mark is configured")]
    Missing,
    #[error("failed to load watermark {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("watermark has no visible pixels")]
    Transparent,
    #[error("watermark scales to nothing on a {width}x{height} rendition")]
    TooSmall { width: u32, height: u32 },
}

/// A mark image plus how to place it.
#[derive(Debug, Clone)]
pub struct Watermark {
    mark: RgbaImage,
    opacity: f32,
    scale: f32,
    position: WatermarkPosition,
    margin: f32,
}

impl Watermark {
    /// Load the configured mark. `Ok(None)` when no mark is configured.
    pub fn load(config: &WatermarkConfig) -> Result<Option<Self>, WatermarkError> {
        let Some(path) = &config.mark_path else {
            return Ok(None);
        };
        let mark = image::open(path).map_err(|source| WatermarkError::Load {
            path: path.clone(),
            source,
        })?;
        log::debug!(
            "loaded watermark {} ({}x{})",
            path.display(),
            mark.width(),
            mark.height()
        );
        Self::from_image(mark, config).map(Some)
    }

    pub fn from_image(mark: DynamicImage, config: &WatermarkConfig) -> Result<Self, WatermarkError> {
        let mark = mark.to_rgba8();
        if mark.pixels().all(|p| p[3] == 0) {
            return Err(WatermarkError::Transparent);
        }
        Ok(Self {
            mark,
            opacity: config.opacity.clamp(0.0, 1.0),
            scale: config.scale,
            position: config.position,
            margin: config.margin,
        })
    }

    /// Composite the mark onto `canvas`, returning an RGB image.
    pub fn apply(&self, canvas: &DynamicImage) -> Result<DynamicImage, WatermarkError> {
        let (width, height) = (canvas.width(), canvas.height());
        let mark_w = (width as f32 * self.scale).round() as u32;
        let mark_h = (self.mark.height() as f32 * mark_w as f32 / self.mark.width() as f32).round() as u32;
        if mark_w == 0 || mark_h == 0 {
            return Err(WatermarkError::TooSmall { width, height });
        }

        let mut mark = imageops::resize(&self.mark, mark_w, mark_h, FilterType::Lanczos3);
        for pixel in mark.pixels_mut() {
            pixel[3] = (pixel[3] as f32 * self.opacity).round() as u8;
        }

        let margin = (width.min(height) as f32 * self.margin).round() as u32;
        let (x, y) = placement((width, height), (mark_w, mark_h), self.position, margin);
        let mut base = canvas.to_rgba8();
        imageops::overlay(&mut base, &mark, x, y);
        Ok(DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(base).to_rgb8()))
    }
}

/// Top-left corner of the mark on the canvas.
fn placement(canvas: (u32, u32), mark: (u32, u32), position: WatermarkPosition, margin: u32) -> (i64, i64) {
    let (cw, ch) = (i64::from(canvas.0), i64::from(canvas.1));
    let (mw, mh) = (i64::from(mark.0), i64::from(mark.1));
    let m = i64::from(margin);
    let (x, y) = match position {
        WatermarkPosition::TopLeft => (m, m),
        WatermarkPosition::TopRight => (cw - mw - m, m),
        WatermarkPosition::BottomLeft => (m, ch - mh - m),
        WatermarkPosition::BottomRight => (cw - mw - m, ch - mh - m),
        WatermarkPosition::Center => ((cw - mw) / 2, (ch - mh) / 2),
    };
    (x.max(0), y.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba};

    fn white_mark(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
    }

    fn black(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])))
    }

    fn config(position: WatermarkPosition) -> WatermarkConfig {
        WatermarkConfig {
            opacity: 1.0,
            scale: 0.5,
            position,
            margin: 0.0,
            ..WatermarkConfig::default()
        }
    }

    #[test]
    fn placement_corners() {
        let canvas = (100, 80);
        let mark = (20, 10);
        assert_eq!(placement(canvas, mark, WatermarkPosition::TopLeft, 5), (5, 5));
        assert_eq!(placement(canvas, mark, WatermarkPosition::TopRight, 5), (75, 5));
        assert_eq!(placement(canvas, mark, WatermarkPosition::BottomLeft, 5), (5, 65));
        assert_eq!(placement(canvas, mark, WatermarkPosition::BottomRight, 5), (75, 65));
        assert_eq!(placement(canvas, mark, WatermarkPosition::Center, 5), (40, 35));
    }

    #[test]
    fn placement_never_goes_negative() {
        assert_eq!(placement((10, 10), (20, 20), WatermarkPosition::BottomRight, 2), (0, 0));
    }

    #[test]
    fn bottom_right_mark_changes_only_that_corner() {
        let wm = Watermark::from_image(white_mark(10, 10), &config(WatermarkPosition::BottomRight)).unwrap();
        let out = wm.apply(&black(64, 64)).unwrap().to_rgb8();
        assert_eq!((out.width(), out.height()), (64, 64));
        // Mark is 32x32 in the bottom-right quadrant.
        assert_eq!(out.get_pixel(48, 48), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(8, 8), &Rgb([0, 0, 0]));
    }

    #[test]
    fn opacity_blends_with_background() {
        let mut cfg = config(WatermarkPosition::Center);
        cfg.opacity = 0.5;
        let wm = Watermark::from_image(white_mark(10, 10), &cfg).unwrap();
        let out = wm.apply(&black(40, 40)).unwrap().to_rgb8();
        let centre = out.get_pixel(20, 20)[0];
        assert!((100..=155).contains(&centre), "centre = {centre}");
    }

    #[test]
    fn fully_transparent_mark_is_rejected() {
        let mark = DynamicImage::ImageRgba8(RgbaImage::new(8, 8));
        assert!(matches!(
            Watermark::from_image(mark, &config(WatermarkPosition::Center)),
            Err(WatermarkError::Transparent)
        ));
    }

    #[test]
    fn tiny_canvas_is_too_small() {
        let mut cfg = config(WatermarkPosition::Center);
        cfg.scale = 0.1;
        let wm = Watermark::from_image(white_mark(10, 10), &cfg).unwrap();
        assert!(matches!(wm.apply(&black(4, 4)), Err(WatermarkError::TooSmall { .. })));
    }

    #[test]
    fn load_without_path_is_none() {
        assert!(Watermark::load(&WatermarkConfig::default()).unwrap().is_none());
    }

    #[test]
    fn load_missing_file_errors() {
        let cfg = WatermarkConfig {
            mark_path: Some("/nonexistent/mark.png".into()),
            ..WatermarkConfig::default()
        };
        assert!(matches!(Watermark::load(&cfg), Err(WatermarkError::Load { .. })));
    }

    #[test]
    fn load_png_from_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("mark.png");
        white_mark(16, 8).save(&path).unwrap();
        let cfg = WatermarkConfig {
            mark_path: Some(path),
            ..WatermarkConfig::default()
        };
        assert!(Watermark::load(&cfg).unwrap().is_some());
    }
}
