//! Error types shared by the models, the sampler and the orchestrator.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by model construction, fitting and sampling.
///
/// Non-convergence is not an error: it is reported through
/// [`crate::models::StopReason::MaxIterations`] next to a usable result.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A class, annotator or item count is not usable for the requested model.
    #[error("invalid dimension: {what} = {value}")]
    InvalidDimension { what: &'static str, value: usize },

    /// The data carries no usable observations for fitting.
    #[error("degenerate data: {0}")]
    DegenerateData(String),

    /// Cells outside `[0, K-1]` or the missing sentinel, ragged rows, or an
    /// annotation design the model cannot express.
    #[error("invalid annotations: {0}")]
    InvalidAnnotations(String),

    /// Model and annotation matrix disagree on a dimension.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    /// A supplied parameter vector violates its probability constraints.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ModelError {
    pub(crate) fn shape(expected: impl Into<String>, found: impl Into<String>) -> Self {
        ModelError::ShapeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}
