//! # Gallery Renditions
//!
//! The media worker behind a client photo gallery. Photographers upload
//! originals straight to object storage; every completed upload produces an
//! event, and this crate turns that event into a fixed set of pre-computed
//! renditions the CDN serves as static files.
//!
//! # Architecture: One Event, One Asset
//!
//! ```text
//! IngressEvent ─→ dispatch ─→ format ─→ fingerprint ─→ decode ─→ imaging ─→ storage
//!                    │                      │                        │
//!                    └──────── status (versioned CAS on the metadata store) ────┘
//! ```
//!
//! Each invocation is synchronous and stateless: everything that must outlive
//! it lives in the object store (bytes) or the metadata store (records). That
//! is what makes it safe to run any number of workers against the same
//! buckets while the event source delivers at least once.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`dispatch`] | Entry point: event → claimed asset → outcome, retry policy |
//! | [`format`] | Magic-byte classification into a closed set of formats |
//! | [`decode`] | Raster, RAW, HEIC and video poster-frame decoders + EXIF orientation |
//! | [`imaging`] | Size-class planning, resampling, encoding, watermark compositing |
//! | [`fingerprint`] | Exact content fingerprints and perceptual near-duplicate hashes |
//! | [`status`] | The only writer of asset records; every transition is one CAS |
//! | [`store`] | Metadata store trait + in-memory and file-backed implementations |
//! | [`storage`] | Object store trait, key and CDN URL conventions |
//! | [`capability`] | Plan tier lookup (watermark, resolution cap, original downloads) |
//! | [`gallery`] | Read side: listings, status polling, deletion cascade |
//! | [`presence`] | Active-viewer counts backed by TTL entries |
//! | [`budget`] | Per-invocation time and memory budget |
//! | [`config`] | `config.toml` loading, validation and the stock template |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Magic Bytes Over Extensions
//!
//! Clients name files whatever they like. The detector trusts the leading
//! bytes and uses the declared extension only to tell a camera RAW from a
//! plain TIFF, since both share the TIFF container.
//!
//! ## Idempotency Without Locks
//!
//! Redelivered and concurrent events are normal. Instead of a lock service,
//! every status change is a compare-and-swap on a versioned record, and a
//! claim that outlives the staleness window is reclaimed by the next
//! delivery. An `active` asset is never processed twice.
//!
//! ## All-Or-Nothing Renditions
//!
//! Every size class is rendered and encoded in memory before the first byte
//! is written. A gallery never shows an asset with half its renditions.
//!
//! ## Duplicates Share, Near-Duplicates Ask
//!
//! A byte-identical re-upload points at the existing renditions and writes
//! nothing. A perceptually similar upload is only flagged; the uploader
//! decides.

pub mod budget;
pub mod capability;
pub mod clock;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod gallery;
pub mod imaging;
pub mod output;
pub mod presence;
pub mod status;
pub mod storage;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
