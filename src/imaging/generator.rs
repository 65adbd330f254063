//! Rendition generator: plan the size classes, then render them in parallel.
//!
//! Planning is pure (source dimensions + config + capabilities in, one
//! [`RenditionSpec`] per class out). Rendering fans out one rayon task per
//! class over the shared oriented canvas and keeps every encoded result in
//! memory, so nothing reaches storage unless all classes succeed.

use super::backend::{BackendError, ImageBackend};
use super::calculations::{capped_long_edge, fit_long_edge, thumbnail_dimensions};
use super::params::{EncodeParams, Fit, Quality, RenditionSpec, Sharpening};
use super::watermark::{Watermark, WatermarkError};
use crate::budget::{Budget, BudgetExceeded};
use crate::capability::Capabilities;
use crate::config::RenditionsConfig;
use crate::format::ContentType;
use crate::types::SizeClass;
use image::DynamicImage;
use rayon::prelude::*;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("{class}: {source}")]
    Backend {
        class: SizeClass,
        #[source]
        source: BackendError,
    },
    #[error("{class}: {source}")]
    Watermark {
        class: SizeClass,
        #[source]
        source: WatermarkError,
    },
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),
}

/// One encoded rendition, not yet written anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRendition {
    pub class: SizeClass,
    pub width: u32,
    pub height: u32,
    pub watermarked: bool,
    pub bytes: Vec<u8>,
}

/// The specs to render for a source of `source` dimensions, smallest first.
pub fn plan_renditions(
    source: (u32, u32),
    content: ContentType,
    config: &RenditionsConfig,
    capabilities: &Capabilities,
    exempt_class: SizeClass,
) -> Vec<RenditionSpec> {
    let classes: BTreeSet<SizeClass> = match content {
        ContentType::Photo => config.photo_classes.iter().copied().collect(),
        ContentType::Video => config.video_classes.iter().copied().collect(),
    };
    let aspect = (config.thumbnail_aspect[0], config.thumbnail_aspect[1]);

    classes
        .into_iter()
        .map(|class| {
            let long_edge = capped_long_edge(config.sizes.long_edge(class), capabilities.max_resolution);
            let ((width, height), fit, sharpening) = match class {
                SizeClass::Thumbnail => (
                    thumbnail_dimensions(source, aspect, long_edge),
                    Fit::Fill,
                    Some(Sharpening::light()),
                ),
                _ => (fit_long_edge(source, long_edge), Fit::LongEdge, None),
            };
            RenditionSpec {
                class,
                width,
                height,
                fit,
                sharpening,
                watermark: capabilities.watermarks(class, exempt_class),
            }
        })
        .collect()
}

/// Encoder settings from config plus the source's colour profile.
pub fn encode_params(config: &RenditionsConfig, icc_profile: Option<Vec<u8>>) -> EncodeParams {
    EncodeParams {
        format: config.format,
        quality: Quality::new(config.quality),
        icc_profile,
    }
}

/// Render and encode every spec. All-or-nothing: the first failure wins.
pub fn render_all(
    backend: &dyn ImageBackend,
    source: &DynamicImage,
    specs: &[RenditionSpec],
    encode: &EncodeParams,
    watermark: Option<&Watermark>,
    budget: &Budget,
) -> Result<Vec<EncodedRendition>, GenerateError> {
    specs
        .par_iter()
        .map(|spec| render_one(backend, source, spec, encode, watermark, budget))
        .collect()
}

fn render_one(
    backend: &dyn ImageBackend,
    source: &DynamicImage,
    spec: &RenditionSpec,
    encode: &EncodeParams,
    watermark: Option<&Watermark>,
    budget: &Budget,
) -> Result<EncodedRendition, GenerateError> {
    let class = spec.class;
    let mut image = backend
        .render(source, spec)
        .map_err(|source| GenerateError::Backend { class, source })?;

    if spec.watermark {
        let mark = watermark.ok_or(GenerateError::Watermark {
            class,
            source: WatermarkError::Missing,
        })?;
        image = mark
            .apply(&image)
            .map_err(|source| GenerateError::Watermark { class, source })?;
    }

    let bytes = backend
        .encode(&image, encode)
        .map_err(|source| GenerateError::Backend { class, source })?;
    budget.check_time(class.as_str())?;
    log::debug!(
        "rendered {class} {}x{} ({} bytes){}",
        image.width(),
        image.height(),
        bytes.len(),
        if spec.watermark { ", watermarked" } else { "" }
    );

    Ok(EncodedRendition {
        class,
        width: image.width(),
        height: image.height(),
        watermarked: spec.watermark,
        bytes,
    })
}
