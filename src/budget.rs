//! Per-invocation wall-clock and memory budget.
//!
//! The hosting environment kills a worker that overruns its limits without
//! warning. Decoders check the budget before large allocations and between
//! stages so an oversized RAW or a slow video probe fails fast with a
//! retryable classification instead.

use crate::config::BudgetConfig;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetExceeded {
    #[error("{stage} ran past the {limit:?} time budget")]
    Time { stage: String, limit: Duration },
    #[error("{width}x{height} needs {needed} bytes, memory budget is {limit}")]
    Memory {
        width: u32,
        height: u32,
        needed: u64,
        limit: u64,
    },
    #[error("{width}x{height} exceeds the {limit} pixel budget")]
    Pixels { width: u32, height: u32, limit: u64 },
}

#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    max_duration: Duration,
    max_memory_bytes: u64,
    max_pixels: u64,
}

impl Budget {
    pub fn new(max_duration: Duration, max_memory_bytes: u64, max_pixels: u64) -> Self {
        Self {
            started: Instant::now(),
            max_duration,
            max_memory_bytes,
            max_pixels,
        }
    }

    /// Starts the clock for one invocation.
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(
            Duration::from_secs(config.max_seconds),
            config.max_memory_mb.saturating_mul(1024 * 1024),
            config.max_pixels,
        )
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.started.elapsed())
    }

    pub fn check_time(&self, stage: &str) -> Result<(), BudgetExceeded> {
        if self.started.elapsed() > self.max_duration {
            return Err(BudgetExceeded::Time {
                stage: stage.to_string(),
                limit: self.max_duration,
            });
        }
        Ok(())
    }

    /// Reject a canvas before it is allocated.
    pub fn check_canvas(&self, width: u32, height: u32, bytes_per_pixel: u64) -> Result<(), BudgetExceeded> {
        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.max_pixels {
            return Err(BudgetExceeded::Pixels {
                width,
                height,
                limit: self.max_pixels,
            });
        }
        let needed = pixels.saturating_mul(bytes_per_pixel);
        if needed > self.max_memory_bytes {
            return Err(BudgetExceeded::Memory {
                width,
                height,
                needed,
                limit: self.max_memory_bytes,
            });
        }
        Ok(())
    }

    /// Decoder limits for the `image` crate derived from this budget.
    pub fn image_limits(&self) -> image::Limits {
        let mut limits = image::Limits::default();
        limits.max_alloc = Some(self.max_memory_bytes);
        let edge = (self.max_pixels as f64).sqrt().ceil().min(f64::from(u32::MAX)) as u32;
        // Panoramas are allowed a long edge well past the square root as long
        // as check_canvas accepts the total.
        limits.max_image_width = Some(edge.saturating_mul(8));
        limits.max_image_height = Some(edge.saturating_mul(8));
        limits
    }
}
