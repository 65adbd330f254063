//! Active-viewer tracking.
//!
//! Each viewer heartbeat writes a short-lived entry in the metadata store, so
//! any worker instance can answer "who is looking at this gallery" without
//! sharing process memory.

use crate::clock::Clock;
use crate::storage::is_valid_id;
use crate::store::{MetadataStore, StoreError};
use chrono::Duration;
use std::sync::Arc;

/// How long a heartbeat keeps a viewer counted.
pub const DEFAULT_PRESENCE_TTL_SECS: i64 = 60;

pub struct PresenceTracker {
    store: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(store, clock, Duration::seconds(DEFAULT_PRESENCE_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Record a heartbeat from `viewer_id`, extending its presence by the TTL.
    pub fn touch(&self, gallery_id: &str, viewer_id: &str) -> Result<(), StoreError> {
        let key = presence_key(gallery_id, viewer_id)?;
        let now = self.clock.now();
        self.store.put_ephemeral(&key, &now.to_rfc3339(), now + self.ttl)
    }

    pub fn active_viewers(&self, gallery_id: &str) -> Result<usize, StoreError> {
        if !is_valid_id(gallery_id) {
            return Err(StoreError::InvalidKey(gallery_id.to_string()));
        }
        self.store
            .count_ephemeral(&format!("presence/{gallery_id}/"), self.clock.now())
    }
}

fn presence_key(gallery_id: &str, viewer_id: &str) -> Result<String, StoreError> {
    for id in [gallery_id, viewer_id] {
        if !is_valid_id(id) {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
    }
    Ok(format!("presence/{gallery_id}/{viewer_id}"))
}
