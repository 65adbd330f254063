//! Camera RAW decoding.
//!
//! `rawloader` parses the container and hands back the sensor mosaic with
//! the camera's calibration. Development is deliberately simple: every 2x2
//! CFA block becomes one output pixel (half-size superpixel demosaic), which
//! is still larger than the biggest rendition for any current sensor and
//! avoids interpolation artefacts.
//!
//! Per block:
//! 1. subtract the black level and scale by the white level per colour
//! 2. apply the as-shot white balance, normalised to green
//! 3. average the two greens
//! 4. camera RGB → linear sRGB through the inverted camera matrix
//! 5. sRGB transfer curve, quantised to 8 bits

use super::{DecodeError, DecodedImage, Decoder, exif};
use crate::budget::Budget;
use crate::format::MediaFormat;
use image::metadata::Orientation;
use image::{DynamicImage, Rgb, RgbImage};
use std::borrow::Cow;
use std::io::Cursor;

/// Rows developed between budget checks.
const ROWS_PER_CHECK: u32 = 64;

const XYZ_FROM_SRGB: [[f32; 3]; 3] = [
    [0.412_456_4, 0.357_576_1, 0.180_437_5],
    [0.212_672_9, 0.715_152_2, 0.072_175_0],
    [0.019_333_9, 0.119_192_0, 0.950_304_1],
];

const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn supports(&self, format: MediaFormat) -> bool {
        format == MediaFormat::Raw
    }

    fn decode(&self, bytes: &[u8], budget: &Budget) -> Result<DecodedImage, DecodeError> {
        let image = rawloader::decode(&mut Cursor::new(bytes))
            .map_err(|e| DecodeError::Corrupt(format!("RAW container: {e:?}")))?;
        budget.check_time("raw container")?;
        log::debug!(
            "RAW {} {}: {}x{} cpp={} cfa={}",
            image.make,
            image.model,
            image.width,
            image.height,
            image.cpp,
            image.cfa.name
        );

        let frame = SensorFrame::from_raw(&image)?;
        let (out_w, out_h) = frame.output_size();
        budget.check_canvas(out_w, out_h, 3)?;
        let canvas = frame.develop(budget)?;

        let orientation = container_orientation(&image.orientation)
            .or_else(|| exif::read_orientation(bytes).and_then(exif::to_orientation))
            .unwrap_or(Orientation::NoTransforms);

        Ok(DecodedImage {
            canvas: DynamicImage::ImageRgb8(canvas),
            orientation,
            color_profile: None,
        })
    }
}

fn container_orientation(orientation: &rawloader::Orientation) -> Option<Orientation> {
    use rawloader::Orientation as Raw;
    match orientation {
        Raw::Normal => Some(Orientation::NoTransforms),
        Raw::HorizontalFlip => Some(Orientation::FlipHorizontal),
        Raw::Rotate180 => Some(Orientation::Rotate180),
        Raw::VerticalFlip => Some(Orientation::FlipVertical),
        Raw::Transpose => Some(Orientation::Rotate90FlipH),
        Raw::Rotate90 => Some(Orientation::Rotate90),
        Raw::Transverse => Some(Orientation::Rotate270FlipH),
        Raw::Rotate270 => Some(Orientation::Rotate270),
        _ => None,
    }
}

/// Sensor data plus the calibration needed to develop it.
#[derive(Debug, Clone)]
struct SensorFrame<'a> {
    width: usize,
    height: usize,
    cpp: usize,
    data: Cow<'a, [u16]>,
    /// top, left, width, height of the active area
    crop: [usize; 4],
    black: [f32; 4],
    white: [f32; 4],
    wb: [f32; 4],
    /// CFA colour at each position of a 2x2 block, relative to the crop origin.
    pattern: [[usize; 2]; 2],
    srgb_from_cam: [[f32; 3]; 3],
}

impl<'a> SensorFrame<'a> {
    fn from_raw(image: &'a rawloader::RawImage) -> Result<Self, DecodeError> {
        let data: Cow<'a, [u16]> = match &image.data {
            rawloader::RawImageData::Integer(values) => Cow::Borrowed(values.as_slice()),
            rawloader::RawImageData::Float(values) => Cow::Owned(
                values
                    .iter()
                    .map(|&v| (v * 65535.0).clamp(0.0, 65535.0) as u16)
                    .collect(),
            ),
        };
        let float = matches!(image.data, rawloader::RawImageData::Float(_));

        let [top, right, bottom, left] = image.crops;
        let crop_w = image.width.saturating_sub(left + right);
        let crop_h = image.height.saturating_sub(top + bottom);

        let mut pattern = [[1usize; 2]; 2];
        for (dy, row) in pattern.iter_mut().enumerate() {
            for (dx, color) in row.iter_mut().enumerate() {
                *color = image.cfa.color_at(top + dy, left + dx).min(3);
            }
        }

        let (black, white) = if float {
            ([0.0; 4], [65535.0; 4])
        } else {
            (
                image.blacklevels.map(f32::from),
                image.whitelevels.map(f32::from),
            )
        };

        let frame = Self {
            width: image.width,
            height: image.height,
            cpp: image.cpp,
            data,
            crop: [top, left, crop_w, crop_h],
            black,
            white,
            wb: normalise_white_balance(image.wb_coeffs),
            pattern,
            srgb_from_cam: camera_matrix(&image.xyz_to_cam),
        };
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.cpp != 1 && self.cpp != 3 {
            return Err(DecodeError::Unsupported(format!(
                "{} components per pixel",
                self.cpp
            )));
        }
        let needed = self.width * self.height * self.cpp;
        if self.data.len() < needed {
            return Err(DecodeError::Corrupt(format!(
                "unexpected end of file: sensor data has {} of {needed} samples",
                self.data.len()
            )));
        }
        let [top, left, w, h] = self.crop;
        if top + h > self.height || left + w > self.width {
            return Err(DecodeError::Corrupt("crop exceeds sensor area".into()));
        }
        let (out_w, out_h) = self.output_size();
        if out_w == 0 || out_h == 0 {
            return Err(DecodeError::Corrupt("sensor area is empty".into()));
        }
        Ok(())
    }

    fn output_size(&self) -> (u32, u32) {
        let [_, _, w, h] = self.crop;
        let (w, h) = if self.cpp == 3 { (w, h) } else { (w / 2, h / 2) };
        (
            u32::try_from(w).unwrap_or(u32::MAX),
            u32::try_from(h).unwrap_or(u32::MAX),
        )
    }

    fn sample(&self, row: usize, col: usize, component: usize) -> f32 {
        let idx = (row * self.width + col) * self.cpp + component;
        f32::from(self.data[idx])
    }

    fn linear(&self, value: f32, color: usize) -> f32 {
        let range = (self.white[color] - self.black[color]).max(1.0);
        ((value - self.black[color]) / range).clamp(0.0, 1.0) * self.wb[color]
    }

    fn develop(&self, budget: &Budget) -> Result<RgbImage, DecodeError> {
        let (out_w, out_h) = self.output_size();
        let [top, left, _, _] = self.crop;
        let mut out = RgbImage::new(out_w, out_h);

        for oy in 0..out_h {
            if oy % ROWS_PER_CHECK == 0 {
                budget.check_time("raw develop")?;
            }
            for ox in 0..out_w {
                let cam = if self.cpp == 3 {
                    let (row, col) = (top + oy as usize, left + ox as usize);
                    [0, 1, 2].map(|c| self.linear(self.sample(row, col, c), c))
                } else {
                    self.superpixel(top + 2 * oy as usize, left + 2 * ox as usize)
                };
                out.put_pixel(ox, oy, Rgb(self.to_srgb(cam)));
            }
        }
        Ok(out)
    }

    /// Average one 2x2 CFA block into camera RGB.
    fn superpixel(&self, row: usize, col: usize) -> [f32; 3] {
        let mut sums = [0.0f32; 3];
        let mut counts = [0u32; 3];
        for dy in 0..2 {
            for dx in 0..2 {
                let color = self.pattern[dy][dx];
                let value = self.linear(self.sample(row + dy, col + dx, 0), color);
                // The fourth CFA colour is the second green.
                let channel = if color == 3 { 1 } else { color };
                sums[channel] += value;
                counts[channel] += 1;
            }
        }
        [0, 1, 2].map(|c| if counts[c] == 0 { 0.0 } else { sums[c] / counts[c] as f32 })
    }

    fn to_srgb(&self, cam: [f32; 3]) -> [u8; 3] {
        let m = &self.srgb_from_cam;
        [0, 1, 2].map(|i| {
            let linear = m[i][0] * cam[0] + m[i][1] * cam[1] + m[i][2] * cam[2];
            (srgb_gamma(linear.clamp(0.0, 1.0)) * 255.0).round() as u8
        })
    }
}

fn normalise_white_balance(coeffs: [f32; 4]) -> [f32; 4] {
    let valid = |v: f32| v.is_finite() && v > 0.0;
    if !valid(coeffs[0]) || !valid(coeffs[1]) || !valid(coeffs[2]) {
        return [1.0; 4];
    }
    let g = coeffs[1];
    let g2 = if valid(coeffs[3]) { coeffs[3] } else { coeffs[1] };
    [coeffs[0] / g, 1.0, coeffs[2] / g, g2 / g]
}

/// Camera RGB → linear sRGB, derived from the camera's XYZ→camera matrix.
///
/// Rows of the sRGB→camera product are normalised to one so that white
/// balanced neutral input stays neutral. Falls back to identity when the
/// camera has no usable matrix.
fn camera_matrix(xyz_to_cam: &[[f32; 3]; 4]) -> [[f32; 3]; 3] {
    let mut cam_from_srgb = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            cam_from_srgb[i][j] = (0..3).map(|k| xyz_to_cam[i][k] * XYZ_FROM_SRGB[k][j]).sum();
        }
        let sum: f32 = cam_from_srgb[i].iter().sum();
        if sum.abs() < 1e-6 {
            return IDENTITY;
        }
        for v in &mut cam_from_srgb[i] {
            *v /= sum;
        }
    }
    invert3(&cam_from_srgb).unwrap_or(IDENTITY)
}

fn invert3(m: &[[f32; 3]; 3]) -> Option<[[f32; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-9 || !det.is_finite() {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv,
        ],
    ])
}

fn srgb_gamma(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}
