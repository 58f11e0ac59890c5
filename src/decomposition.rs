// src/decomposition.rs
//
// SVD of the (time × space) anomaly matrix and the quantities derived from
// it: eigenvalues, variance fractions, and PC/EOF scalings.

use crate::config::{EofScaling, PcScaling, SvdStrategy};
use crate::error::{EofError, Result};
use crate::linalg_backends::{BackendEigh, BackendQR, BackendSVD, LinAlgBackendProvider};
use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Smallest `σ_k / σ_1` the Gram path accepts.
///
/// Gram eigenvalues carry an absolute error of about `n·ε·σ_1²`, so the
/// relative error on `σ_k²` grows like `n·ε·(σ_1 / σ_k)²`. At this ratio it
/// stays near `1e-8`; below it the full SVD is used instead.
const GRAM_RELATIVE_SINGULAR_FLOOR: f64 = 1e-3;

/// `Auto` uses the Gram path when `GRAM_TRUNCATION_RATIO * neofs <= min(T, S)`.
const GRAM_TRUNCATION_RATIO: usize = 4;

/// Options for [`decompose`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecompositionOptions {
    pub center: bool,
    pub ddof: usize,
    pub neofs: Option<usize>,
    pub strategy: SvdStrategy,
}

impl Default for DecompositionOptions {
    fn default() -> Self {
        DecompositionOptions {
            center: true,
            ddof: 1,
            neofs: None,
            strategy: SvdStrategy::Auto,
        }
    }
}

/// Result of decomposing a `(T, S)` matrix `X = U Σ Vᵀ`.
///
/// EOFs (columns of `V`) are orthonormal. Unscaled PCs (`UΣ`) are mutually
/// orthogonal over time. For each mode the EOF element of largest magnitude
/// is non-negative. Built once by [`DecompositionResult::from_parts`] and
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionResult {
    singular_values: Array1<f64>,
    eigenvalues: Array1<f64>,
    variance_fraction: Array1<f64>,
    total_variance: f64,
    u: Array2<f64>,
    eofs: Array2<f64>,
    time_mean: Option<Array1<f64>>,
    ddof: usize,
}

impl DecompositionResult {
    /// Assembles a result from singular triplets.
    ///
    /// * `u` - `(T, k)` left singular vectors.
    /// * `singular_values` - `(k,)`, descending.
    /// * `v` - `(S, k)` right singular vectors.
    /// * `total_sum_squares` - `‖X‖²_F` of the full anomaly matrix, so that
    ///   variance fractions stay correct when only `k` modes are kept.
    pub fn from_parts(
        mut u: Array2<f64>,
        singular_values: Array1<f64>,
        mut v: Array2<f64>,
        total_sum_squares: f64,
        ddof: usize,
        time_mean: Option<Array1<f64>>,
    ) -> Result<Self> {
        let n_times = u.nrows();
        let k = singular_values.len();
        if u.ncols() != k || v.ncols() != k {
            return Err(EofError::ShapeMismatch(format!(
                "singular triplets disagree: U has {} columns, Σ has {}, V has {}",
                u.ncols(),
                k,
                v.ncols()
            )));
        }
        if n_times <= ddof {
            return Err(EofError::InvalidInputShape(format!(
                "T - ddof must be positive (T = {}, ddof = {})",
                n_times, ddof
            )));
        }
        apply_sign_convention(&mut u, &mut v);

        let normalizer = (n_times - ddof) as f64;
        let eigenvalues = singular_values.mapv(|sv| sv * sv / normalizer);
        let total_variance = total_sum_squares / normalizer;
        let variance_fraction = if total_variance > 0.0 {
            eigenvalues.mapv(|lam| lam / total_variance)
        } else {
            Array1::zeros(k)
        };
        Ok(Self {
            singular_values,
            eigenvalues,
            variance_fraction,
            total_variance,
            u,
            eofs: v,
            time_mean,
            ddof,
        })
    }

    pub fn n_modes(&self) -> usize {
        self.singular_values.len()
    }

    pub fn n_times(&self) -> usize {
        self.u.nrows()
    }

    pub fn n_points(&self) -> usize {
        self.eofs.nrows()
    }

    pub fn ddof(&self) -> usize {
        self.ddof
    }

    /// `T - ddof`.
    pub fn normalizer(&self) -> f64 {
        (self.n_times() - self.ddof) as f64
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    /// `σ² / (T - ddof)`, descending.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Eigenvalues over the total anomaly variance. Sums to 1 over all
    /// `min(T, S)` modes.
    pub fn variance_fraction(&self) -> &Array1<f64> {
        &self.variance_fraction
    }

    /// Sum of the variances of every column of the anomaly matrix.
    pub fn total_variance(&self) -> f64 {
        self.total_variance
    }

    /// `(T, k)` unit-norm left singular vectors.
    pub fn u(&self) -> &Array2<f64> {
        &self.u
    }

    /// `(S, k)` orthonormal EOFs in the (weighted) space that was decomposed.
    pub fn eofs(&self) -> &Array2<f64> {
        &self.eofs
    }

    /// Time mean that was removed, if the matrix was centered.
    pub fn time_mean(&self) -> Option<&Array1<f64>> {
        self.time_mean.as_ref()
    }

    /// `(T, k)` principal components under `scaling`.
    pub fn pcs(&self, scaling: PcScaling) -> Array2<f64> {
        match scaling {
            PcScaling::Unscaled => &self.u * &self.singular_values,
            // UΣ / sqrt(σ²/n) = U·sqrt(n); written this way so zero modes stay finite.
            PcScaling::UnitVariance => &self.u * self.normalizer().sqrt(),
            PcScaling::UnitNorm => self.u.clone(),
            PcScaling::SqrtEigenvalue => {
                let factor = &self.singular_values * &self.eigenvalues.mapv(f64::sqrt);
                &self.u * &factor
            }
        }
    }

    /// `(S, k)` EOFs under `scaling`. Division by a zero eigenvalue yields NaN.
    pub fn scaled_eofs(&self, scaling: EofScaling) -> Array2<f64> {
        match scaling {
            EofScaling::Unscaled => self.eofs.clone(),
            EofScaling::DivideSqrtEigenvalue => {
                let factor = self.eigenvalues.mapv(|lam| if lam > 0.0 { 1.0 / lam.sqrt() } else { f64::NAN });
                &self.eofs * &factor
            }
            EofScaling::MultiplySqrtEigenvalue => &self.eofs * &self.eigenvalues.mapv(f64::sqrt),
        }
    }
}

/// Makes the largest-magnitude element of every EOF column non-negative,
/// flipping the matching column of `u` with it. Ties go to the first element.
pub fn apply_sign_convention(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for (mut v_col, mut u_col) in v.columns_mut().into_iter().zip(u.columns_mut()) {
        if dominant_sign(v_col.view()) < 0.0 {
            v_col.mapv_inplace(|x| -x);
            u_col.mapv_inplace(|x| -x);
        }
    }
}

/// Sign of the first element of largest magnitude, `1.0` for an all-zero vector.
pub(crate) fn dominant_sign(values: ArrayView1<f64>) -> f64 {
    let mut pivot = 0.0_f64;
    for &x in values.iter() {
        if x.abs() > pivot.abs() {
            pivot = x;
        }
    }
    if pivot < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Subtracts the column means in place and returns them.
pub fn center_columns(matrix: &mut Array2<f64>) -> Result<Array1<f64>> {
    let mean = matrix
        .mean_axis(Axis(0))
        .ok_or_else(|| EofError::InvalidInputShape("cannot compute the time mean of an empty matrix".to_string()))?;
    *matrix -= &mean;
    Ok(mean)
}

/// Decomposes a `(T, S)` matrix.
///
/// Centers the columns if requested, computes the SVD with the chosen
/// strategy, and derives eigenvalues and variance fractions.
///
/// # Errors
/// * `EmptyField` if `S == 0`.
/// * `InvalidInputShape` if `T < 2`, `T <= ddof`, `neofs == Some(0)` or the
///   matrix holds non-finite values.
/// * `NumericalFailure` if the linear algebra backend fails.
pub fn decompose(matrix: ArrayView2<f64>, options: &DecompositionOptions) -> Result<DecompositionResult> {
    let (n_times, n_points) = matrix.dim();
    if n_points == 0 {
        return Err(EofError::EmptyField);
    }
    if n_times < 2 {
        return Err(EofError::InvalidInputShape(format!(
            "at least 2 time samples are required, got {}",
            n_times
        )));
    }
    if n_times <= options.ddof {
        return Err(EofError::InvalidInputShape(format!(
            "T - ddof must be positive (T = {}, ddof = {})",
            n_times, options.ddof
        )));
    }
    if options.neofs == Some(0) {
        return Err(EofError::InvalidInputShape("neofs must be at least 1".to_string()));
    }
    if matrix.iter().any(|x| !x.is_finite()) {
        return Err(EofError::InvalidInputShape("matrix contains non-finite values".to_string()));
    }

    let start_time = std::time::Instant::now();
    let mut anomalies = matrix.to_owned();
    let time_mean = if options.center {
        Some(center_columns(&mut anomalies)?)
    } else {
        None
    };
    let total_sum_squares: f64 = anomalies.iter().map(|x| x * x).sum();

    let max_modes = n_times.min(n_points);
    let n_modes = options.neofs.map_or(max_modes, |k| k.min(max_modes));
    let strategy = match options.strategy {
        SvdStrategy::Auto if options.neofs.is_some() && GRAM_TRUNCATION_RATIO * n_modes <= max_modes => SvdStrategy::Gram,
        SvdStrategy::Auto => SvdStrategy::Full,
        other => other,
    };
    debug!(
        "Decomposing {} x {} matrix for {} modes using {:?}.",
        n_times, n_points, n_modes, strategy
    );

    let backend = LinAlgBackendProvider::<f64>::new();
    let (u, sv, v) = match strategy {
        SvdStrategy::Gram => match gram_svd(&backend, &anomalies, n_modes)? {
            Some(triplets) => triplets,
            None => {
                debug!(
                    "Requested spectrum spans more than {:.0e} in singular value; using the full SVD instead of the Gram path.",
                    1.0 / GRAM_RELATIVE_SINGULAR_FLOOR
                );
                full_svd(&backend, &anomalies, n_modes)?
            }
        },
        SvdStrategy::Randomized { oversamples, power_iterations, seed } => {
            randomized_svd(&backend, &anomalies, n_modes, oversamples, power_iterations, seed)?
        }
        _ => full_svd(&backend, &anomalies, n_modes)?,
    };

    let result = DecompositionResult::from_parts(u, sv, v, total_sum_squares, options.ddof, time_mean)?;
    info!(
        "Computed {} modes of a {} x {} matrix in {:?} (leading variance fraction {:.4}).",
        result.n_modes(),
        n_times,
        n_points,
        start_time.elapsed(),
        result.variance_fraction().get(0).copied().unwrap_or(0.0)
    );
    Ok(result)
}

type Triplets = (Array2<f64>, Array1<f64>, Array2<f64>);

fn full_svd<B: BackendSVD>(backend: &B, anomalies: &Array2<f64>, n_modes: usize) -> Result<Triplets> {
    let svd = backend
        .svd_thin(anomalies.clone())
        .map_err(|e| EofError::numerical("SVD of the anomaly matrix failed", e))?;
    let u = svd
        .u
        .ok_or_else(|| EofError::NumericalFailure("SVD did not return left singular vectors".to_string()))?;
    let vt = svd
        .vt
        .ok_or_else(|| EofError::NumericalFailure("SVD did not return right singular vectors".to_string()))?;
    let k = n_modes.min(svd.s.len());
    Ok((
        u.slice(s![.., ..k]).to_owned(),
        svd.s.slice(s![..k]).to_owned(),
        vt.slice(s![..k, ..]).t().to_owned(),
    ))
}

/// Exact truncated SVD through the smaller Gram matrix.
///
/// Returns `None` when a requested singular value is below
/// `GRAM_RELATIVE_SINGULAR_FLOOR · σ_1`: squaring the matrix would cost that
/// mode its accuracy, and a zero mode has no partner vector to project.
fn gram_svd<B: BackendEigh>(backend: &B, anomalies: &Array2<f64>, n_modes: usize) -> Result<Option<Triplets>> {
    let (n_times, n_points) = anomalies.dim();
    let tall = n_points <= n_times;
    let gram = if tall {
        anomalies.t().dot(anomalies)
    } else {
        anomalies.dot(&anomalies.t())
    };
    let eig = backend
        .eigh_upper(&gram)
        .map_err(|e| EofError::numerical("eigendecomposition of the Gram matrix failed", e))?;

    // eigh returns ascending eigenvalues; walk from the top.
    let n = eig.eigenvalues.len();
    let order: Vec<usize> = (0..n_modes.min(n)).map(|i| n - 1 - i).collect();
    let singular_values: Array1<f64> = order.iter().map(|&i| eig.eigenvalues[i].max(0.0).sqrt()).collect();
    let largest = singular_values.get(0).copied().unwrap_or(0.0);
    if largest <= 0.0 || singular_values.iter().any(|&sv| sv <= GRAM_RELATIVE_SINGULAR_FLOOR * largest) {
        return Ok(None);
    }
    let basis = eig.eigenvectors.select(Axis(1), &order);

    // The other side is X·b/σ (tall) or Xᵀ·b/σ (wide), re-normalised to unit length.
    let mut partner = if tall {
        anomalies.dot(&basis)
    } else {
        anomalies.t().dot(&basis)
    };
    for (mut col, &sv) in partner.columns_mut().into_iter().zip(singular_values.iter()) {
        col.mapv_inplace(|x| x / sv);
        let norm = col.dot(&col).sqrt();
        if norm > 0.0 {
            col.mapv_inplace(|x| x / norm);
        }
    }
    trace!("Gram path recovered {} modes from a {}x{} Gram matrix.", order.len(), n, n);
    Ok(Some(if tall {
        (partner, singular_values, basis)
    } else {
        (basis, singular_values, partner)
    }))
}

/// Randomized SVD: Gaussian sketch, QR range finder with power iterations,
/// then an exact SVD of the small projected matrix.
fn randomized_svd<B: BackendSVD + BackendQR>(
    backend: &B,
    anomalies: &Array2<f64>,
    n_modes: usize,
    oversamples: usize,
    power_iterations: usize,
    seed: u64,
) -> Result<Triplets> {
    let (n_times, n_points) = anomalies.dim();
    let sketch_width = (n_modes + oversamples).min(n_times.min(n_points)).max(1);
    trace!(
        "Randomized SVD: target {} modes, sketch width {}, {} power iterations.",
        n_modes,
        sketch_width,
        power_iterations
    );

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let omega = Array2::<f64>::random_using((n_points, sketch_width), StandardNormal, &mut rng);
    let qr = |m: &Array2<f64>, what: &str| {
        backend
            .qr_q_factor(m)
            .map_err(|e| EofError::numerical(&format!("QR of {} failed", what), e))
    };

    let mut q_basis = qr(&anomalies.dot(&omega), "the initial sketch")?;
    for iter_idx in 0..power_iterations {
        let q_tilde = qr(&anomalies.t().dot(&q_basis), "a power iteration (Xᵀ Q)")?;
        q_basis = qr(&anomalies.dot(&q_tilde), "a power iteration (X Q)")?;
        trace!("Randomized SVD power iteration {}/{} done.", iter_idx + 1, power_iterations);
    }
    if q_basis.ncols() == 0 {
        return Err(EofError::NumericalFailure("randomized range finder produced an empty basis".to_string()));
    }

    let projected = q_basis.t().dot(anomalies);
    let svd = backend
        .svd_thin(projected)
        .map_err(|e| EofError::numerical("SVD of the projected sketch failed", e))?;
    let u_small = svd
        .u
        .ok_or_else(|| EofError::NumericalFailure("sketch SVD did not return U".to_string()))?;
    let vt = svd
        .vt
        .ok_or_else(|| EofError::NumericalFailure("sketch SVD did not return Vᵀ".to_string()))?;
    let k = n_modes.min(svd.s.len());
    if k < n_modes {
        warn!("Randomized SVD recovered {} of {} requested modes.", k, n_modes);
    }
    let u = q_basis.dot(&u_small.slice(s![.., ..k]));
    Ok((u, svd.s.slice(s![..k]).to_owned(), vt.slice(s![..k, ..]).t().to_owned()))
}
