//! Persistence & status manager.
//!
//! The only writer of asset records. Every transition is one versioned
//! compare-and-swap against the metadata store; losing the swap is reported
//! back to the caller as a lost race, never retried blindly.
//!
//! ```text
//!             claim                mark_active / mark_duplicate
//!   pending ─────────→ processing ─────────────────────────────→ active
//!      ↑                   │  │
//!      └─release_for_retry─┘  └─mark_failed──→ failed ──requeue──→ pending
//! ```
//!
//! A `processing` claim older than the staleness window is treated as
//! abandoned and can be claimed again. Each claim counts one attempt.
//! A duplicate whose canonical asset disappears while the share is being
//! settled goes back from `active` to `processing` (`reclaim_duplicate`).

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::format::MediaFormat;
use crate::storage::OriginalKey;
use crate::store::{MetadataStore, StoreError, Versioned, WriteOutcome};
use crate::types::{Asset, AssetStatus, NearDuplicate, Rendition, RenditionPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Longest staleness window representable without overflow (100 years).
const MAX_STALENESS_SECS: u64 = 100 * 365 * 24 * 3600;

/// Result of trying to move an asset into `processing`.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This worker holds the claim at the returned version.
    Acquired(Versioned<Asset>),
    AlreadyActive(Asset),
    /// Another worker holds a fresh claim.
    InFlight(Asset),
    /// `failed` records are only revived by an operator requeue.
    Terminal(Asset),
    /// The attempt budget ran out; the record is now `failed`.
    Exhausted(Asset),
    /// Another writer changed the record between read and swap.
    LostRace,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    Requeued(Asset),
    NotFailed(AssetStatus),
    Missing,
}

/// What processing learned about the original, persisted with any outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    pub format: Option<MediaFormat>,
    pub fingerprint: Option<String>,
    pub perceptual_hash: Option<String>,
    pub near_duplicate: Option<NearDuplicate>,
}

impl Findings {
    fn apply(&self, asset: &mut Asset) {
        if self.format.is_some() {
            asset.format = self.format;
        }
        if self.fingerprint.is_some() {
            asset.fingerprint.clone_from(&self.fingerprint);
        }
        if self.perceptual_hash.is_some() {
            asset.perceptual_hash.clone_from(&self.perceptual_hash);
        }
        asset.near_duplicate.clone_from(&self.near_duplicate);
    }
}

pub struct StatusManager {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    staleness: chrono::Duration,
    max_attempts: u32,
}

impl StatusManager {
    pub fn new(store: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>, config: &DispatchConfig) -> Self {
        let secs = config.staleness_secs.min(MAX_STALENESS_SECS) as i64;
        Self {
            store,
            clock,
            staleness: chrono::Duration::seconds(secs),
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn get(&self, id: &str) -> Result<Option<Versioned<Asset>>, StoreError> {
        self.store.get_asset(id)
    }

    /// Create the `pending` record for an upload, or return the existing one.
    ///
    /// Concurrent registrations converge on whichever create landed first.
    pub fn register(&self, key: &OriginalKey, byte_size: u64) -> Result<Versioned<Asset>, StoreError> {
        let asset = Asset::pending(
            &key.asset_id,
            &key.gallery_id,
            &key.to_key(),
            &key.filename,
            byte_size,
            self.clock.now(),
        );
        loop {
            if let WriteOutcome::Written { version } = self.store.create_asset(&asset)? {
                log::info!("asset {}: registered as pending", asset.id);
                return Ok(Versioned {
                    version,
                    value: asset,
                });
            }
            if let Some(existing) = self.store.get_asset(&asset.id)? {
                return Ok(existing);
            }
            // Deleted between our create and read; try the create again.
        }
    }

    fn is_stale(&self, asset: &Asset, now: DateTime<Utc>) -> bool {
        asset
            .processing_started_at
            .is_none_or(|started| now - started >= self.staleness)
    }

    pub fn claim(&self, id: &str) -> Result<Claim, StoreError> {
        let Some(current) = self.store.get_asset(id)? else {
            return Ok(Claim::Missing);
        };
        let now = self.clock.now();
        match current.value.status {
            AssetStatus::Active => return Ok(Claim::AlreadyActive(current.value)),
            AssetStatus::Failed => return Ok(Claim::Terminal(current.value)),
            AssetStatus::Processing if !self.is_stale(&current.value, now) => {
                return Ok(Claim::InFlight(current.value));
            }
            AssetStatus::Processing => {
                log::warn!(
                    "asset {id}: reclaiming processing claim from {:?} (attempt {})",
                    current.value.processing_started_at,
                    current.value.attempts + 1
                );
            }
            AssetStatus::Pending => {}
        }

        let mut next = current.value.clone();
        next.updated_at = now;
        if next.attempts >= self.max_attempts {
            let last = next
                .error
                .take()
                .unwrap_or_else(|| "processing claim expired".to_string());
            next.status = AssetStatus::Failed;
            next.error = Some(format!("retry_budget_exhausted: {last}"));
            next.processing_started_at = None;
            next.processed_at = Some(now);
            return Ok(match self.store.update_asset(&next, current.version)? {
                WriteOutcome::Written { .. } => {
                    log::error!("asset {id}: failed after {} attempts", next.attempts);
                    Claim::Exhausted(next)
                }
                WriteOutcome::Conflict => Claim::LostRace,
            });
        }

        next.status = AssetStatus::Processing;
        next.attempts += 1;
        next.processing_started_at = Some(now);
        Ok(match self.store.update_asset(&next, current.version)? {
            WriteOutcome::Written { version } => {
                log::info!("asset {id}: claimed for processing (attempt {})", next.attempts);
                Claim::Acquired(Versioned { version, value: next })
            }
            WriteOutcome::Conflict => {
                log::warn!("asset {id}: lost the claim to another worker");
                Claim::LostRace
            }
        })
    }

    /// `processing → active` with freshly generated renditions.
    pub fn mark_active(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        renditions: Vec<Rendition>,
        policy: RenditionPolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let mut next = self.finished(claimed, findings, AssetStatus::Active);
        next.renditions = renditions;
        next.policy = Some(policy);
        let outcome = self.store.update_asset(&next, claimed.version)?;
        self.log_transition(&next, outcome);
        Ok(outcome)
    }

    /// `processing → active` sharing `canonical`'s renditions.
    ///
    /// Returns the record as written, or `None` if the claim was lost.
    pub fn mark_duplicate(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        canonical: &Asset,
        original_retained: bool,
    ) -> Result<Option<Versioned<Asset>>, StoreError> {
        let mut next = self.finished(claimed, findings, AssetStatus::Active);
        next.renditions = canonical.renditions.clone();
        next.policy = canonical.policy;
        next.duplicate_of = Some(canonical.id.clone());
        next.original_retained = original_retained;
        let outcome = self.store.update_asset(&next, claimed.version)?;
        self.log_transition(&next, outcome);
        Ok(match outcome {
            WriteOutcome::Written { version } => Some(Versioned { version, value: next }),
            WriteOutcome::Conflict => None,
        })
    }

    /// `active → processing` for a duplicate whose canonical asset went away
    /// before the share was settled. Same attempt, fresh claim timestamp.
    pub fn reclaim_duplicate(&self, shared: &Versioned<Asset>) -> Result<Option<Versioned<Asset>>, StoreError> {
        let now = self.clock.now();
        let mut next = shared.value.clone();
        next.status = AssetStatus::Processing;
        next.renditions.clear();
        next.policy = None;
        next.duplicate_of = None;
        next.original_retained = true;
        next.processing_started_at = Some(now);
        next.processed_at = None;
        next.updated_at = now;
        Ok(match self.store.update_asset(&next, shared.version)? {
            WriteOutcome::Written { version } => {
                log::warn!("asset {}: shared renditions vanished, processing it afresh", next.id);
                Some(Versioned { version, value: next })
            }
            WriteOutcome::Conflict => {
                log::warn!("asset {}: record changed before the share could be undone", next.id);
                None
            }
        })
    }

    /// `processing → failed` with a `kind: message` reason. Renditions stay empty.
    pub fn mark_failed(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        reason: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut next = self.finished(claimed, findings, AssetStatus::Failed);
        next.renditions.clear();
        next.policy = None;
        next.error = Some(reason.to_string());
        let outcome = self.store.update_asset(&next, claimed.version)?;
        self.log_transition(&next, outcome);
        Ok(outcome)
    }

    /// `processing → pending` after a retryable failure, keeping the attempt count.
    pub fn release_for_retry(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        reason: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let mut next = claimed.value.clone();
        findings.apply(&mut next);
        next.status = AssetStatus::Pending;
        next.error = Some(reason.to_string());
        next.processing_started_at = None;
        next.updated_at = self.clock.now();
        let outcome = self.store.update_asset(&next, claimed.version)?;
        match outcome {
            WriteOutcome::Written { .. } => log::warn!(
                "asset {}: released for retry after attempt {}/{}: {reason}",
                next.id,
                next.attempts,
                self.max_attempts
            ),
            WriteOutcome::Conflict => log::warn!("asset {}: claim lost before release", next.id),
        }
        Ok(outcome)
    }

    /// Operator action: `failed → pending` with a clean slate.
    pub fn requeue(&self, id: &str) -> Result<Requeue, StoreError> {
        loop {
            let Some(current) = self.store.get_asset(id)? else {
                return Ok(Requeue::Missing);
            };
            if current.value.status != AssetStatus::Failed {
                return Ok(Requeue::NotFailed(current.value.status));
            }
            let mut next = current.value.clone();
            next.status = AssetStatus::Pending;
            next.attempts = 0;
            next.error = None;
            next.renditions.clear();
            next.policy = None;
            next.duplicate_of = None;
            next.near_duplicate = None;
            next.processing_started_at = None;
            next.processed_at = None;
            next.updated_at = self.clock.now();
            if self.store.update_asset(&next, current.version)?.is_written() {
                log::info!("asset {id}: requeued");
                return Ok(Requeue::Requeued(next));
            }
        }
    }

    /// Remove the record if it has not changed since `current` was read.
    pub fn delete(&self, current: &Versioned<Asset>) -> Result<WriteOutcome, StoreError> {
        let outcome = self.store.delete_asset(&current.value.id, current.version)?;
        if outcome.is_written() {
            log::info!("asset {}: record deleted", current.value.id);
        }
        Ok(outcome)
    }

    fn finished(&self, claimed: &Versioned<Asset>, findings: &Findings, status: AssetStatus) -> Asset {
        let now = self.clock.now();
        let mut next = claimed.value.clone();
        findings.apply(&mut next);
        next.status = status;
        next.error = None;
        next.processing_started_at = None;
        next.processed_at = Some(now);
        next.updated_at = now;
        next
    }

    fn log_transition(&self, next: &Asset, outcome: WriteOutcome) {
        match (outcome, next.status) {
            (WriteOutcome::Conflict, _) => {
                log::warn!("asset {}: record changed under the claim; {} not written", next.id, next.status)
            }
            (_, AssetStatus::Failed) => log::error!(
                "asset {}: failed: {}",
                next.id,
                next.error.as_deref().unwrap_or("unknown error")
            ),
            (_, status) => log::info!("asset {}: {status}", next.id),
        }
    }
}
