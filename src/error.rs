//! Pipeline error taxonomy.
//!
//! Every failure a dispatch can hit is folded into [`PipelineError`], which
//! decides two things: whether redelivery may succeed
//! ([`is_retryable`](PipelineError::is_retryable)) and the stable
//! classification stored on a failed asset ([`kind`](PipelineError::kind)).

use crate::capability::CapabilityError;
use crate::decode::DecodeError;
use crate::format::UnsupportedFormat;
use crate::imaging::{GenerateError, WatermarkError};
use crate::storage::StorageError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    FormatUnsupported(String),
    #[error("{0}")]
    DecodeCorrupt(String),
    #[error("{0}")]
    DecodeResourceExhausted(String),
    #[error("{0}")]
    EncodeFailure(String),
    #[error("{0}")]
    WatermarkFailed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl PipelineError {
    /// Whether a later attempt on the same bytes might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DecodeResourceExhausted(_)
                | Self::EncodeFailure(_)
                | Self::Storage(_)
                | Self::Store(_)
                | Self::Capability(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FormatUnsupported(_) => "format_unsupported",
            Self::DecodeCorrupt(_) => "decode_corrupt",
            Self::DecodeResourceExhausted(_) => "decode_resource_exhausted",
            Self::EncodeFailure(_) => "encode_failure",
            Self::WatermarkFailed(_) => "watermark_required_but_failed",
            Self::Storage(_) => "storage_failure",
            Self::Store(_) => "metadata_store_failure",
            Self::Capability(_) => "capability_lookup_failure",
        }
    }

    /// `kind: message`, the form recorded on a failed asset.
    pub fn reason(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}

impl From<DecodeError> for PipelineError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Corrupt(msg) => Self::DecodeCorrupt(msg),
            DecodeError::ResourceExhausted(msg) => Self::DecodeResourceExhausted(msg),
            DecodeError::Unsupported(msg) => Self::FormatUnsupported(msg),
        }
    }
}

impl From<UnsupportedFormat> for PipelineError {
    fn from(e: UnsupportedFormat) -> Self {
        Self::FormatUnsupported(e.to_string())
    }
}

impl From<WatermarkError> for PipelineError {
    fn from(e: WatermarkError) -> Self {
        Self::WatermarkFailed(e.to_string())
    }
}

impl From<GenerateError> for PipelineError {
    fn from(e: GenerateError) -> Self {
        match e {
            GenerateError::Backend { .. } => Self::EncodeFailure(e.to_string()),
            GenerateError::Watermark { .. } => Self::WatermarkFailed(e.to_string()),
            GenerateError::Budget(b) => Self::DecodeResourceExhausted(b.to_string()),
        }
    }
}
