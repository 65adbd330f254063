//! Trigger/dispatch layer.
//!
//! One [`IngressEvent`] in, one [`DispatchOutcome`] out. Delivery is
//! at-least-once and possibly concurrent, so every step is either
//! idempotent or guarded by a conditional write:
//!
//! ```text
//! parse key ─→ register (create-if-absent) ─→ claim (CAS → processing)
//!   ─→ read original ─→ detect format ─→ plan terms ─→ exact fingerprint
//!        ├─ hit on an active asset made under the same terms
//!        │     ─→ mark_duplicate (no renditions written) ─→ canonical still there?
//!        └─ miss, other terms, or canonical gone ─→ decode ─→ orient ─→ perceptual hash ─→ plan
//!              ─→ render + watermark (parallel, in memory)
//!              ─→ write all renditions ─→ mark_active (CAS)
//! ```
//!
//! Retryable failures hand the claim back (`pending`) and surface as a
//! [`DispatchError`] so the event source redelivers. Terminal failures are
//! recorded on the asset and reported as [`DispatchOutcome::Failed`].

use crate::budget::Budget;
use crate::capability::CapabilityProvider;
use crate::clock::{Clock, SystemClock};
use crate::config::{OriginalPolicy, PipelineConfig};
use crate::decode::DecoderRegistry;
use crate::error::PipelineError;
use crate::fingerprint::{DuplicateDetector, Fingerprint, PerceptualHash};
use crate::format;
use crate::imaging::{
    EncodedRendition, ImageBackend, RustBackend, Watermark, WatermarkError, encode_params, plan_renditions,
    render_all,
};
use crate::status::{Claim, Findings, Requeue, StatusManager};
use crate::storage::{ObjectStore, OriginalKey, cdn_url, rendition_key};
use crate::store::{MetadataStore, Versioned, WriteOutcome};
use crate::types::{Asset, AssetStatus, IngressEvent, NearDuplicate, Rendition, RenditionFormat};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a delivery did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The original was deleted before its event arrived.
    Gone,
    /// Redelivery of an event whose asset is already `active`.
    AlreadyActive,
    /// Another worker holds a fresh claim.
    InFlight,
    /// The asset is `failed`; only a requeue revives it.
    Failed,
    /// A conditional write lost to a concurrent worker.
    LostRace,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gone => "gone",
            Self::AlreadyActive => "already_active",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::LostRace => "lost_race",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Activated {
        asset_id: String,
        renditions: Vec<Rendition>,
        near_duplicate: Option<NearDuplicate>,
    },
    Duplicate {
        asset_id: String,
        of: String,
    },
    Skipped {
        asset_id: String,
        reason: SkipReason,
    },
    /// The event does not name an upload this pipeline owns.
    Rejected {
        object_key: String,
        reason: String,
    },
    Failed {
        asset_id: String,
        reason: String,
    },
}

/// A retryable failure: the event should be redelivered.
#[derive(Error, Debug)]
#[error("asset {}: {source}", .asset_id.as_deref().unwrap_or("-"))]
pub struct DispatchError {
    pub asset_id: Option<String>,
    #[source]
    pub source: PipelineError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    Redispatched(DispatchOutcome),
    NotFailed(AssetStatus),
    Missing,
}

pub struct Dispatcher {
    config: PipelineConfig,
    bucket: Option<String>,
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn MetadataStore>,
    status: StatusManager,
    duplicates: DuplicateDetector,
    capabilities: Arc<dyn CapabilityProvider>,
    decoders: DecoderRegistry,
    backend: Box<dyn ImageBackend + Send>,
    watermark: Option<Watermark>,
}

impl Dispatcher {
    /// A dispatcher with the production decoders, backend and system clock.
    pub fn new(
        config: PipelineConfig,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn MetadataStore>,
        capabilities: Arc<dyn CapabilityProvider>,
    ) -> Self {
        let status = StatusManager::new(store.clone(), Arc::new(SystemClock), &config.dispatch);
        let duplicates = DuplicateDetector::new(store.clone());
        Self {
            config,
            bucket: None,
            objects,
            store,
            status,
            duplicates,
            capabilities,
            decoders: DecoderRegistry::default(),
            backend: Box::new(RustBackend::new()),
            watermark: None,
        }
    }

    /// Only accept events from `bucket`.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.status = StatusManager::new(self.store.clone(), clock, &self.config.dispatch);
        self
    }

    pub fn with_decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_backend(mut self, backend: impl ImageBackend + Send + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn with_watermark(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn dispatch(&self, event: &IngressEvent) -> Result<DispatchOutcome, DispatchError> {
        if let Some(bucket) = &self.bucket
            && event.bucket_name != *bucket
        {
            log::warn!("rejecting {}: event from unexpected bucket {}", event.object_key, event.bucket_name);
            return Ok(DispatchOutcome::Rejected {
                object_key: event.object_key.clone(),
                reason: format!("unexpected bucket {}", event.bucket_name),
            });
        }
        let Some(key) = OriginalKey::parse(&event.object_key) else {
            log::warn!("rejecting {}: not an originals/{{gallery}}/{{asset}}/{{file}} key", event.object_key);
            return Ok(DispatchOutcome::Rejected {
                object_key: event.object_key.clone(),
                reason: "malformed object key".into(),
            });
        };
        let asset_id = key.asset_id.clone();
        let retry = |source: PipelineError| DispatchError {
            asset_id: Some(key.asset_id.clone()),
            source,
        };

        if self.status.get(&asset_id).map_err(|e| retry(e.into()))?.is_none() {
            if !self.objects.exists(&event.object_key).map_err(|e| retry(e.into()))? {
                log::info!("asset {asset_id}: original is gone, nothing to do");
                return Ok(skipped(asset_id, SkipReason::Gone));
            }
            self.status
                .register(&key, event.size)
                .map_err(|e| retry(e.into()))?;
        }

        let mut claimed = match self.status.claim(&asset_id).map_err(|e| retry(e.into()))? {
            Claim::Acquired(claimed) => claimed,
            Claim::AlreadyActive(_) => {
                log::info!("asset {asset_id}: already active, redelivery ignored");
                return Ok(skipped(asset_id, SkipReason::AlreadyActive));
            }
            Claim::InFlight(_) => {
                log::info!("asset {asset_id}: being processed elsewhere, redelivery ignored");
                return Ok(skipped(asset_id, SkipReason::InFlight));
            }
            Claim::Terminal(_) => {
                log::info!("asset {asset_id}: failed earlier; requeue to retry");
                return Ok(skipped(asset_id, SkipReason::Failed));
            }
            Claim::Exhausted(asset) => {
                return Ok(DispatchOutcome::Failed {
                    asset_id,
                    reason: asset.error.unwrap_or_default(),
                });
            }
            Claim::LostRace => return Ok(skipped(asset_id, SkipReason::LostRace)),
            Claim::Missing => return Ok(skipped(asset_id, SkipReason::Gone)),
        };

        let mut findings = Findings::default();
        match self.process(&mut claimed, &mut findings) {
            Ok(outcome) => Ok(outcome),
            Err(error) => self.fail(&claimed, &findings, error),
        }
    }

    /// Operator re-queue: `failed → pending`, then dispatch a synthesised event.
    pub fn requeue(&self, asset_id: &str) -> Result<RequeueOutcome, DispatchError> {
        let requeued = self.status.requeue(asset_id).map_err(|e| DispatchError {
            asset_id: Some(asset_id.to_string()),
            source: e.into(),
        })?;
        match requeued {
            Requeue::Requeued(asset) => {
                let event = IngressEvent {
                    bucket_name: self.bucket.clone().unwrap_or_default(),
                    object_key: asset.original_key,
                    size: asset.byte_size,
                };
                self.dispatch(&event).map(RequeueOutcome::Redispatched)
            }
            Requeue::NotFailed(status) => Ok(RequeueOutcome::NotFailed(status)),
            Requeue::Missing => Ok(RequeueOutcome::Missing),
        }
    }

    /// Run the pipeline under `claimed`. If a duplicate share has to be
    /// undone, `claimed` is replaced by the fresh claim.
    fn process(
        &self,
        claimed: &mut Versioned<Asset>,
        findings: &mut Findings,
    ) -> Result<DispatchOutcome, PipelineError> {
        let asset = claimed.value.clone();
        let bytes = self.objects.get(&asset.original_key)?;
        let format = format::detect(&bytes, asset.declared_extension.as_deref())?;
        findings.format = Some(format);

        let capabilities = self.capabilities.capabilities(&asset.gallery_id)?;
        let policy = capabilities.policy(self.config.watermark.exempt_class);

        let fingerprint = Fingerprint::of(&bytes);
        findings.fingerprint = Some(fingerprint.to_string());
        if let Some(canonical) = self.duplicates.find_exact(&asset.gallery_id, &fingerprint, &asset.id)? {
            if canonical.policy == Some(policy) {
                match self.finish_duplicate(claimed, findings, &canonical)? {
                    Shared::Settled(outcome) => return Ok(outcome),
                    Shared::Undone(reclaimed) => *claimed = reclaimed,
                }
            } else {
                log::info!(
                    "asset {}: same bytes as {}, rendered under other plan terms; rendering afresh",
                    asset.id,
                    canonical.id
                );
            }
        }
        if !self.duplicates.claim(&asset.gallery_id, &fingerprint, &asset.id)? {
            log::debug!("asset {}: fingerprint already held by another asset", asset.id);
        }

        if capabilities.watermark && self.watermark.is_none() {
            return Err(WatermarkError::Missing.into());
        }

        let budget = Budget::from_config(&self.config.budget);
        let decoded = self.decoders.decode(format, &bytes, &budget)?;
        drop(bytes);
        let icc_profile = decoded.color_profile.clone();
        let canvas = decoded.oriented();

        let hash = PerceptualHash::of(&canvas);
        findings.perceptual_hash = Some(hash.to_hex());
        findings.near_duplicate =
            self.duplicates
                .find_near(&asset.gallery_id, &asset.id, hash, self.config.duplicates.near_threshold)?;
        if let Some(near) = &findings.near_duplicate {
            log::info!(
                "asset {}: looks like {} (similarity {:.2})",
                asset.id,
                near.asset_id,
                near.similarity
            );
        }

        let specs = plan_renditions(
            (canvas.width(), canvas.height()),
            format.content_type(),
            &self.config.renditions,
            &capabilities,
            self.config.watermark.exempt_class,
        );
        let encode = encode_params(&self.config.renditions, icc_profile);
        let rendered = render_all(
            &*self.backend,
            &canvas,
            &specs,
            &encode,
            self.watermark.as_ref(),
            &budget,
        )?;
        log::debug!("asset {}: rendered {} classes in {:?}", asset.id, rendered.len(), budget.elapsed());

        let renditions = self.write_renditions(&asset, &rendered, encode.format)?;
        match self.status.mark_active(claimed, findings, renditions.clone(), policy)? {
            WriteOutcome::Written { .. } => Ok(DispatchOutcome::Activated {
                asset_id: asset.id.clone(),
                renditions,
                near_duplicate: findings.near_duplicate.clone(),
            }),
            WriteOutcome::Conflict => Ok(skipped(asset.id.clone(), SkipReason::LostRace)),
        }
    }

    fn finish_duplicate(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        canonical: &Asset,
    ) -> Result<Shared, PipelineError> {
        let asset = &claimed.value;
        let retained = self.config.duplicates.original == OriginalPolicy::Retain;
        log::info!("asset {}: exact duplicate of {}", asset.id, canonical.id);
        let Some(shared) = self.status.mark_duplicate(claimed, findings, canonical, retained)? else {
            return Ok(Shared::Settled(skipped(asset.id.clone(), SkipReason::LostRace)));
        };

        // Deleting the canonical asset removes its record before it looks for
        // other holders of its renditions. Either that deletion sees the share
        // written above and keeps them, or the record is already gone here.
        if !self.still_shareable(canonical)? {
            return Ok(match self.status.reclaim_duplicate(&shared)? {
                Some(reclaimed) => Shared::Undone(reclaimed),
                None => Shared::Settled(skipped(asset.id.clone(), SkipReason::LostRace)),
            });
        }

        if !retained && let Err(e) = self.objects.delete(&asset.original_key) {
            log::warn!("asset {}: failed to discard duplicate original: {e}", asset.id);
        }
        Ok(Shared::Settled(DispatchOutcome::Duplicate {
            asset_id: asset.id.clone(),
            of: canonical.id.clone(),
        }))
    }

    /// `canonical` is still active with the same renditions, all in storage.
    fn still_shareable(&self, canonical: &Asset) -> Result<bool, PipelineError> {
        let Some(current) = self.status.get(&canonical.id)? else {
            return Ok(false);
        };
        if current.value.status != AssetStatus::Active || current.value.renditions != canonical.renditions {
            return Ok(false);
        }
        for rendition in &canonical.renditions {
            if !self.objects.exists(&rendition.key)? {
                log::warn!("asset {}: rendition {} is missing from storage", canonical.id, rendition.key);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write every rendition or none: a failed put removes what was written.
    fn write_renditions(
        &self,
        asset: &Asset,
        rendered: &[EncodedRendition],
        format: RenditionFormat,
    ) -> Result<Vec<Rendition>, PipelineError> {
        let mut written: Vec<Rendition> = Vec::with_capacity(rendered.len());
        for r in rendered {
            let key = rendition_key(&asset.gallery_id, &asset.id, r.class, format);
            if let Err(e) = self.objects.put(&key, &r.bytes) {
                for done in &written {
                    if let Err(cleanup) = self.objects.delete(&done.key) {
                        log::warn!("asset {}: failed to remove partial rendition {}: {cleanup}", asset.id, done.key);
                    }
                }
                return Err(e.into());
            }
            written.push(Rendition {
                size: r.class,
                url: cdn_url(&self.config.cdn.base_url, &asset.gallery_id, &asset.id, r.class, format),
                key,
                width: r.width,
                height: r.height,
                byte_size: r.bytes.len() as u64,
                format,
                watermarked: r.watermarked,
            });
        }
        Ok(written)
    }

    fn fail(
        &self,
        claimed: &Versioned<Asset>,
        findings: &Findings,
        error: PipelineError,
    ) -> Result<DispatchOutcome, DispatchError> {
        let asset_id = claimed.value.id.clone();
        let reason = error.reason();

        if error.is_retryable() && claimed.value.attempts < self.status.max_attempts() {
            if let Err(e) = self.status.release_for_retry(claimed, findings, &reason) {
                log::warn!("asset {asset_id}: could not release claim, it will go stale: {e}");
            }
            return Err(DispatchError {
                asset_id: Some(asset_id),
                source: error,
            });
        }

        let reason = if error.is_retryable() {
            format!("retry_budget_exhausted: {reason}")
        } else {
            reason
        };
        let outcome = self
            .status
            .mark_failed(claimed, findings, &reason)
            .map_err(|e| DispatchError {
                asset_id: Some(asset_id.clone()),
                source: e.into(),
            })?;
        Ok(match outcome {
            WriteOutcome::Written { .. } => DispatchOutcome::Failed { asset_id, reason },
            WriteOutcome::Conflict => skipped(asset_id, SkipReason::LostRace),
        })
    }
}

/// How an exact-duplicate share ended.
enum Shared {
    Settled(DispatchOutcome),
    /// The canonical asset went away; render under this fresh claim.
    Undone(Versioned<Asset>),
}

fn skipped(asset_id: String, reason: SkipReason) -> DispatchOutcome {
    DispatchOutcome::Skipped { asset_id, reason }
}
