//! Capability query for the plan/feature collaborator.
//!
//! The pipeline asks once per invocation what a gallery's owner is entitled
//! to. Plan-tier logic itself lives elsewhere; [`StaticCapabilities`] answers
//! from the `[capabilities]` table in the config file.

use crate::config::CapabilitiesConfig;
use crate::types::{RenditionPolicy, SizeClass};
use serde::Serialize;
use thiserror::Error;

/// Features that shape a gallery's renditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub watermark: bool,
    /// Long-edge cap applied to every size class.
    pub max_resolution: Option<u32>,
    pub original_download: bool,
}

impl Capabilities {
    /// The rendition terms these capabilities impose, with `exempt_class`
    /// left unmarked when the plan grants original downloads.
    pub fn policy(&self, exempt_class: SizeClass) -> RenditionPolicy {
        RenditionPolicy {
            watermark: self.watermark,
            max_resolution: self.max_resolution,
            watermark_exempt: (self.watermark && self.original_download).then_some(exempt_class),
        }
    }

    pub fn watermarks(&self, class: SizeClass, exempt_class: SizeClass) -> bool {
        self.watermark && !(self.original_download && class == exempt_class)
    }
}

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("unknown plan '{plan}' for gallery {gallery_id}")]
    UnknownPlan { gallery_id: String, plan: String },
    #[error("capability service unavailable: {0}")]
    Unavailable(String),
}

pub trait CapabilityProvider: Send + Sync {
    fn capabilities(&self, gallery_id: &str) -> Result<Capabilities, CapabilityError>;
}

/// Plan table from configuration.
#[derive(Debug, Clone)]
pub struct StaticCapabilities {
    config: CapabilitiesConfig,
}

impl StaticCapabilities {
    pub fn new(config: CapabilitiesConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn capabilities(&self, gallery_id: &str) -> Result<Capabilities, CapabilityError> {
        let plan_name = self
            .config
            .galleries
            .get(gallery_id)
            .unwrap_or(&self.config.default_plan);
        let plan = self
            .config
            .plans
            .get(plan_name)
            .ok_or_else(|| CapabilityError::UnknownPlan {
                gallery_id: gallery_id.to_string(),
                plan: plan_name.clone(),
            })?;
        Ok(Capabilities {
            watermark: plan.watermark,
            max_resolution: plan.max_resolution,
            original_download: plan.original_download,
        })
    }
}
