// src/error.rs

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EofError>;

/// Boxed error type returned by the linear algebra backends.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure an EOF analysis can raise.
///
/// Errors are raised at the point of detection and never swallowed. A failed
/// operation returns no partial result.
#[derive(Error, Debug)]
pub enum EofError {
    /// Wrong rank, too few time samples, non-finite data, or an invalid option.
    #[error("invalid input shape: {0}")]
    InvalidInputShape(String),

    /// Multivariate inputs must all have the same number of time samples.
    #[error("field {field_id} has {found} time samples, but field 0 has {expected}")]
    TimeMismatch {
        field_id: usize,
        expected: usize,
        found: usize,
    },

    /// A spatial point is missing at some, but not all, time steps.
    #[error(
        "missing values detected in different locations at different times \
         (first at flat spatial position {position}, missing in {missing_steps} of {time_steps} time steps)"
    )]
    InconsistentMissingness {
        position: usize,
        missing_steps: usize,
        time_steps: usize,
    },

    /// No valid spatial points remain after masking.
    #[error("field has no valid (non-missing) spatial points")]
    EmptyField,

    /// Negative or non-finite weight.
    #[error("invalid weight: {0}")]
    InvalidWeight(String),

    /// Weight array cannot be broadcast against the spatial grid.
    #[error("weights of shape {weights:?} cannot be broadcast to spatial shape {spatial:?}")]
    WeightShape {
        weights: Vec<usize>,
        spatial: Vec<usize>,
    },

    /// An input does not match the spatial layout stored by the analysis.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The decomposition routine failed. Not retried.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// Raised only when a caller asks for a converged rotation explicitly.
    #[error("rotation did not converge within {iterations} iterations (last criterion change {last_change:e})")]
    RotationNonConvergence { iterations: usize, last_change: f64 },

    /// The requested container adapter is unknown or unavailable.
    #[error("unsupported container '{name}'")]
    UnsupportedContainer { name: String },
}

impl EofError {
    /// Wraps a backend failure with the step that produced it.
    pub(crate) fn numerical(context: &str, source: BackendError) -> Self {
        EofError::NumericalFailure(format!("{}: {}", context, source))
    }
}
