//! Error types emitted while building the mixing unit.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A hyperparameter combination that cannot produce a valid unit.
    #[error("invalid ACmix configuration: {0}")]
    InvalidConfig(String),
    /// Parameters were requested in a non floating-point dtype.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
