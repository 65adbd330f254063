//! CLI output formatting.
//!
//! Output leads with the asset id, the identity operators search logs for,
//! with detail on indented context lines underneath.
//!
//! # Output Format
//!
//! ## Dispatch
//!
//! ```text
//! a1 activated (4 renditions)
//!     thumbnail: 256x256 https://cdn.example.com/g1/a1/thumbnail.jpg
//!     large: 2048x1365 https://cdn.example.com/g1/a1/large.jpg
//!     Near duplicate: a0 (similarity 0.94)
//! a2 duplicate of a1
//! a3 skipped: already_active
//! a4 failed: decode_corrupt: unexpected end of file
//! ```
//!
//! ## List
//!
//! ```text
//! 001 a1 beach.jpg (4 renditions)
//! 002 a7 IMG_0042.CR2 (4 renditions)
//!
//! 2 visible of 3 assets
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::dispatch::{DispatchOutcome, RequeueOutcome};
use crate::gallery::DeleteOutcome;
use crate::types::{Asset, NearDuplicate, Rendition};

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn rendition_line(r: &Rendition) -> String {
    format!("{}{}: {}x{} {}", indent(1), r.size, r.width, r.height, r.url)
}

fn near_duplicate_line(near: &NearDuplicate) -> String {
    format!(
        "{}Near duplicate: {} (similarity {:.2})",
        indent(1),
        near.asset_id,
        near.similarity
    )
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub fn format_dispatch_outcome(outcome: &DispatchOutcome) -> Vec<String> {
    match outcome {
        DispatchOutcome::Activated {
            asset_id,
            renditions,
            near_duplicate,
        } => {
            let mut lines = vec![format!(
                "{asset_id} activated ({})",
                plural(renditions.len(), "rendition")
            )];
            lines.extend(renditions.iter().map(rendition_line));
            if let Some(near) = near_duplicate {
                lines.push(near_duplicate_line(near));
            }
            lines
        }
        DispatchOutcome::Duplicate { asset_id, of } => vec![format!("{asset_id} duplicate of {of}")],
        DispatchOutcome::Skipped { asset_id, reason } => vec![format!("{asset_id} skipped: {reason}")],
        DispatchOutcome::Rejected { object_key, reason } => {
            vec![format!("{object_key} rejected: {reason}")]
        }
        DispatchOutcome::Failed { asset_id, reason } => vec![format!("{asset_id} failed: {reason}")],
    }
}

pub fn print_dispatch_outcome(outcome: &DispatchOutcome) {
    for line in format_dispatch_outcome(outcome) {
        println!("{}", line);
    }
}

pub fn format_requeue_outcome(asset_id: &str, outcome: &RequeueOutcome) -> Vec<String> {
    match outcome {
        RequeueOutcome::Redispatched(dispatched) => {
            let mut lines = vec![format!("{asset_id} requeued")];
            lines.extend(format_dispatch_outcome(dispatched));
            lines
        }
        RequeueOutcome::NotFailed(status) => {
            vec![format!("{asset_id} not requeued: status is {status}, only failed assets can be requeued")]
        }
        RequeueOutcome::Missing => vec![format!("{asset_id} not found")],
    }
}

pub fn print_requeue_outcome(asset_id: &str, outcome: &RequeueOutcome) {
    for line in format_requeue_outcome(asset_id, outcome) {
        println!("{}", line);
    }
}

// ============================================================================
// Status and listing
// ============================================================================

/// Operator view of one asset record.
///
/// ```text
/// a1 failed
///     Source: originals/g1/a1/IMG_1.jpg
///     Format: jpeg
///     Attempts: 1
///     Error: decode_corrupt: unexpected end of file
/// ```
pub fn format_asset_status(asset: &Asset) -> Vec<String> {
    let ctx = indent(1);
    let mut lines = vec![format!("{} {}", asset.id, asset.status)];
    lines.push(format!("{ctx}Source: {}", asset.original_key));
    if !asset.original_retained {
        lines.push(format!("{ctx}Original: discarded"));
    }
    if let Some(format) = asset.format {
        lines.push(format!("{ctx}Format: {}", format.as_str()));
    }
    lines.push(format!("{ctx}Attempts: {}", asset.attempts));
    if let Some(of) = &asset.duplicate_of {
        lines.push(format!("{ctx}Duplicate of: {of}"));
    }
    if let Some(near) = &asset.near_duplicate {
        lines.push(near_duplicate_line(near));
    }
    if let Some(error) = &asset.error {
        lines.push(format!("{ctx}Error: {error}"));
    }
    lines.extend(asset.renditions.iter().map(rendition_line));
    lines
}

pub fn print_asset_status(asset: &Asset) {
    for line in format_asset_status(asset) {
        println!("{}", line);
    }
}

/// Gallery listing. `all` is every asset; only `active` ones are numbered.
pub fn format_gallery_listing(gallery_id: &str, all: &[Asset]) -> Vec<String> {
    let visible: Vec<&Asset> = all.iter().filter(|a| a.is_visible()).collect();
    if all.is_empty() {
        return vec![format!("Gallery {gallery_id} is empty")];
    }
    let mut lines: Vec<String> = visible
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "{} {} {} ({})",
                format_index(i + 1),
                a.id,
                a.filename,
                plural(a.renditions.len(), "rendition")
            )
        })
        .collect();
    for a in all.iter().filter(|a| !a.is_visible()) {
        lines.push(format!("{}{} {} [{}]", indent(1), a.id, a.filename, a.status));
    }
    lines.push(String::new());
    lines.push(format!("{} visible of {}", visible.len(), plural(all.len(), "asset")));
    lines
}

pub fn print_gallery_listing(gallery_id: &str, all: &[Asset]) {
    for line in format_gallery_listing(gallery_id, all) {
        println!("{}", line);
    }
}

// ============================================================================
// Deletion
// ============================================================================

pub fn format_delete_outcome(asset_id: &str, outcome: &DeleteOutcome) -> Vec<String> {
    match outcome {
        DeleteOutcome::Deleted { removed, shared } => {
            let mut lines = vec![format!(
                "Deleted {asset_id} ({} removed, {} kept)",
                plural(removed.len(), "object"),
                plural(shared.len(), "shared rendition")
            )];
            lines.extend(removed.iter().map(|k| format!("{}- {k}", indent(1))));
            lines
        }
        DeleteOutcome::InFlight => vec![format!("{asset_id} is being processed; try again later")],
        DeleteOutcome::Changed => vec![format!("{asset_id} changed during delete; try again")],
        DeleteOutcome::Missing => vec![format!("{asset_id} not found")],
    }
}

pub fn print_delete_outcome(asset_id: &str, outcome: &DeleteOutcome) {
    for line in format_delete_outcome(asset_id, outcome) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================
