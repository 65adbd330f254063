//! Rendition imaging: sizing, resampling, encoding and watermarking.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Long-edge fit** | `resize_exact` + Lanczos3 |
//! | **Thumbnail** | `resize_to_fill` + `unsharpen` |
//! | **Encode** | `JpegEncoder` (default) or `AvifEncoder` (rav1e) |
//! | **Watermark** | Lanczos3-scaled RGBA mark + `imageops::overlay` |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing rendition work
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Generator**: Plans the size classes and renders them in parallel
//! - **Watermark**: The compositor applied between resize and encode

pub mod backend;
mod calculations;
pub mod generator;
mod params;
pub mod rust_backend;
pub mod watermark;

pub use backend::{BackendError, ImageBackend};
pub use calculations::{capped_long_edge, crop_box, fit_long_edge, thumbnail_dimensions};
pub use generator::{EncodedRendition, GenerateError, encode_params, plan_renditions, render_all};
pub use params::{EncodeParams, Fit, Quality, RenditionSpec, Sharpening};
pub use rust_backend::RustBackend;
pub use watermark::{Watermark, WatermarkError};
