// src/config.rs

use serde::{Deserialize, Serialize};

/// What to do with spatial points that are missing at only some time steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingPolicy {
    /// Fail with `InconsistentMissingness`.
    #[default]
    Strict,
    /// Exclude any point that is missing at any time step.
    Lenient,
}

/// How the SVD of the anomaly matrix is computed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum SvdStrategy {
    /// `Gram` when few modes are requested relative to `min(T, S)`, `Full` otherwise.
    #[default]
    Auto,
    /// Economy SVD of the whole anomaly matrix.
    Full,
    /// Eigendecomposition of the smaller of `XᵀX` and `XXᵀ`.
    Gram,
    /// Randomized SVD (Halko, Martinsson & Tropp 2011).
    Randomized {
        /// Extra sketch columns beyond the requested modes.
        oversamples: usize,
        power_iterations: usize,
        seed: u64,
    },
}

/// Scaling applied to principal component time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PcScaling {
    /// `UΣ`: each PC has variance equal to its eigenvalue.
    #[default]
    Unscaled,
    /// Divided by `sqrt(λ)`: unit variance over time.
    UnitVariance,
    /// The left singular vectors: unit Euclidean norm.
    UnitNorm,
    /// Multiplied by `sqrt(λ)`.
    SqrtEigenvalue,
}

/// Scaling applied to EOF patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EofScaling {
    #[default]
    Unscaled,
    DivideSqrtEigenvalue,
    MultiplySqrtEigenvalue,
}

/// Units EOF patterns are reported in.
///
/// `Weighted` EOFs are orthonormal. `Unweighted` EOFs are divided by the
/// weight multiplier, which puts them in physical units but leaves them
/// orthogonal only in direction when weights are not uniform. Points with a
/// zero weight become NaN in `Unweighted` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EofUnits {
    #[default]
    Weighted,
    Unweighted,
}

/// Configuration for building an EOF analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EofConfig {
    /// Remove the time-mean of each spatial point before decomposing.
    pub center: bool,
    /// Delta degrees of freedom: eigenvalues are `σ² / (T - ddof)`.
    pub ddof: usize,
    /// Number of modes to retain. `None` keeps `min(T, S)`.
    pub neofs: Option<usize>,
    pub missing_policy: MissingPolicy,
    pub svd_strategy: SvdStrategy,
    /// Effective number of independent samples for North's rule of thumb.
    /// `None` uses the number of time samples.
    pub neff: Option<f64>,
}

impl Default for EofConfig {
    fn default() -> Self {
        EofConfig {
            center: true,
            ddof: 1,
            neofs: None,
            missing_policy: MissingPolicy::Strict,
            svd_strategy: SvdStrategy::Auto,
            neff: None,
        }
    }
}
