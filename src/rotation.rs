// src/rotation.rs
//
// Orthogonal (varimax) and oblique (promax) rotation of retained modes.

use crate::decomposition::dominant_sign;
use crate::error::{EofError, Result};
use crate::linalg_backends::{pseudo_inverse, LinAlgBackendProvider};
use crate::multivariate::ChannelTable;
use crate::solver::EofSolver;
use log::{debug, info, trace, warn};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

const PINV_RCOND: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum RotationMethod {
    /// Identity rotation.
    None,
    #[default]
    Varimax,
    /// Varimax followed by an oblique power transform (Hendrickson & White 1964).
    Promax { power: f64 },
}

/// Controls for the varimax iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarimaxOptions {
    /// Kaiser row normalization by communalities.
    pub normalize: bool,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for VarimaxOptions {
    fn default() -> Self {
        VarimaxOptions { normalize: true, max_iter: 1000, tol: 1e-10 }
    }
}

/// Rotation of the leading `neofs` modes of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    pub neofs: usize,
    pub method: RotationMethod,
    /// Rotate EOFs multiplied by `sqrt(λ)` instead of unit-norm EOFs.
    pub scaled: bool,
    pub normalize: bool,
    pub max_iter: usize,
    pub tol: f64,
}

impl RotationConfig {
    /// Varimax with the default iteration controls.
    pub fn new(neofs: usize) -> Self {
        let defaults = VarimaxOptions::default();
        RotationConfig {
            neofs,
            method: RotationMethod::Varimax,
            scaled: true,
            normalize: defaults.normalize,
            max_iter: defaults.max_iter,
            tol: defaults.tol,
        }
    }

    pub fn with_method(mut self, method: RotationMethod) -> Self {
        self.method = method;
        self
    }

    fn varimax_options(&self) -> VarimaxOptions {
        VarimaxOptions { normalize: self.normalize, max_iter: self.max_iter, tol: self.tol }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RotationStatus {
    Converged { iterations: usize },
    NotConverged { iterations: usize, last_change: f64 },
}

impl RotationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, RotationStatus::Converged { .. })
    }
}

/// A rotation matrix and how the iteration that produced it ended.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub matrix: Array2<f64>,
    pub status: RotationStatus,
}

fn varimax_criterion(loadings: &Array2<f64>) -> f64 {
    let p = loadings.nrows() as f64;
    loadings
        .columns()
        .into_iter()
        .map(|col| {
            let sq_sum: f64 = col.iter().map(|x| x * x).sum();
            let quad_sum: f64 = col.iter().map(|x| x.powi(4)).sum();
            (p * quad_sum - sq_sum * sq_sum) / (p * p)
        })
        .sum()
}

/// Varimax rotation of `(p, k)` loadings by pairwise plane rotations.
///
/// Returns `R` such that `loadings · R` is the rotated set. Reaching
/// `max_iter` without the criterion settling is reported in the status and
/// logged, and the best rotation found is still returned.
pub fn varimax(loadings: ArrayView2<f64>, options: &VarimaxOptions) -> Result<Rotation> {
    let (p, k) = loadings.dim();
    if p == 0 || k == 0 {
        return Err(EofError::InvalidInputShape("varimax needs a non-empty loading matrix".to_string()));
    }
    let mut rotation = Array2::<f64>::eye(k);
    if k == 1 {
        return Ok(Rotation { matrix: rotation, status: RotationStatus::Converged { iterations: 0 } });
    }

    let mut work = loadings.to_owned();
    let communalities: Array1<f64> = work.rows().into_iter().map(|r| r.dot(&r).sqrt()).collect();
    if options.normalize {
        for (mut row, &h) in work.rows_mut().into_iter().zip(communalities.iter()) {
            if h > 0.0 {
                row.mapv_inplace(|x| x / h);
            }
        }
    }

    let pf = p as f64;
    let mut criterion = varimax_criterion(&work);
    let mut last_change = f64::INFINITY;
    for iteration in 1..=options.max_iter {
        for j in 0..k - 1 {
            for l in j + 1..k {
                let (mut a, mut b, mut c, mut d) = (0.0, 0.0, 0.0, 0.0);
                for i in 0..p {
                    let x = work[[i, j]];
                    let y = work[[i, l]];
                    let u = x * x - y * y;
                    let v = 2.0 * x * y;
                    a += u;
                    b += v;
                    c += u * u - v * v;
                    d += 2.0 * u * v;
                }
                let numerator = d - 2.0 * a * b / pf;
                let denominator = c - (a * a - b * b) / pf;
                let phi = 0.25 * numerator.atan2(denominator);
                if phi.abs() < f64::EPSILON {
                    continue;
                }
                let (sin, cos) = phi.sin_cos();
                for m in [&mut work, &mut rotation] {
                    for i in 0..m.nrows() {
                        let x = m[[i, j]];
                        let y = m[[i, l]];
                        m[[i, j]] = x * cos + y * sin;
                        m[[i, l]] = -x * sin + y * cos;
                    }
                }
            }
        }
        let updated = varimax_criterion(&work);
        last_change = (updated - criterion).abs();
        criterion = updated;
        trace!("Varimax sweep {}: criterion {:.6e}, change {:.3e}.", iteration, criterion, last_change);
        if last_change < options.tol {
            debug!("Varimax converged after {} sweeps.", iteration);
            return Ok(Rotation { matrix: rotation, status: RotationStatus::Converged { iterations: iteration } });
        }
    }
    warn!(
        "Varimax did not converge in {} sweeps (last criterion change {:.3e}); returning the last rotation.",
        options.max_iter, last_change
    );
    Ok(Rotation {
        matrix: rotation,
        status: RotationStatus::NotConverged { iterations: options.max_iter, last_change },
    })
}

/// Promax rotation: varimax, then a least-squares fit towards the target
/// `L·|L|^(power-1)` with columns rescaled. The result is not orthogonal.
pub fn promax(loadings: ArrayView2<f64>, power: f64, options: &VarimaxOptions) -> Result<Rotation> {
    if !(power.is_finite() && power >= 1.0) {
        return Err(EofError::InvalidInputShape(format!("promax power must be at least 1, got {}", power)));
    }
    let base = varimax(loadings, options)?;
    if loadings.ncols() < 2 {
        return Ok(base);
    }
    let backend = LinAlgBackendProvider::<f64>::new();
    let rotated = loadings.dot(&base.matrix);
    let target = rotated.mapv(|x| x * x.abs().powf(power - 1.0));
    let fit = pseudo_inverse(&backend, rotated.view(), PINV_RCOND)
        .map_err(|e| EofError::numerical("pseudo-inverse of the varimax loadings failed", e))?
        .dot(&target);
    let gram_inv = pseudo_inverse(&backend, fit.t().dot(&fit).view(), PINV_RCOND)
        .map_err(|e| EofError::numerical("inverting the promax normal matrix failed", e))?;
    let col_scale = gram_inv.diag().mapv(|d| d.max(0.0).sqrt());
    let transform = fit * &col_scale;
    Ok(Rotation { matrix: base.matrix.dot(&transform), status: base.status })
}

/// Rotated modes with variances recomputed and re-sorted descending.
#[derive(Debug, Clone)]
pub struct RotatedResult {
    method: RotationMethod,
    scaled: bool,
    rotation: Array2<f64>,
    eofs: Array2<f64>,
    pcs: Array2<f64>,
    variance: Array1<f64>,
    variance_fraction: Array1<f64>,
    status: RotationStatus,
    channels: ChannelTable,
}

impl RotatedResult {
    pub fn method(&self) -> RotationMethod {
        self.method
    }

    pub fn is_scaled(&self) -> bool {
        self.scaled
    }

    /// `(k, k)` matrix mapping the unrotated loadings to the rotated ones, with
    /// columns in the re-sorted order.
    pub fn rotation(&self) -> &Array2<f64> {
        &self.rotation
    }

    /// `(S, k)` rotated EOFs in weighted units (times `sqrt(λ)` if scaled).
    pub fn eofs_flat(&self) -> &Array2<f64> {
        &self.eofs
    }

    /// Rotated EOFs per field, each `(k, *spatial)`. `renormalize` gives every
    /// pattern unit length.
    pub fn eofs(&self, renormalize: bool) -> Result<Vec<ArrayD<f64>>> {
        let mut patterns = self.eofs.t().to_owned();
        if renormalize {
            for mut row in patterns.rows_mut() {
                let norm = row.dot(&row).sqrt();
                if norm > 0.0 {
                    row.mapv_inplace(|x| x / norm);
                }
            }
        }
        self.channels.split_unflatten(patterns.view())
    }

    /// `(T, k)` rotated PCs. `PCs · EOFsᵀ` spans the unrotated subspace.
    pub fn pcs(&self) -> &Array2<f64> {
        &self.pcs
    }

    pub fn variance(&self) -> &Array1<f64> {
        &self.variance
    }

    pub fn variance_fraction(&self) -> &Array1<f64> {
        &self.variance_fraction
    }

    pub fn status(&self) -> RotationStatus {
        self.status
    }

    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Turns a non-converged rotation into `RotationNonConvergence`.
    pub fn require_converged(self) -> Result<Self> {
        match self.status {
            RotationStatus::Converged { .. } => Ok(self),
            RotationStatus::NotConverged { iterations, last_change } => {
                Err(EofError::RotationNonConvergence { iterations, last_change })
            }
        }
    }
}

/// Rotates the leading modes of an [`EofSolver`].
pub struct Rotator;

impl Rotator {
    pub fn rotate(solver: &EofSolver, config: &RotationConfig) -> Result<RotatedResult> {
        let decomposition = solver.decomposition();
        let n = config.neofs;
        if n == 0 || n > decomposition.n_modes() {
            return Err(EofError::InvalidInputShape(format!(
                "cannot rotate {} modes, {} are retained",
                n,
                decomposition.n_modes()
            )));
        }
        let start_time = std::time::Instant::now();
        let leading: Vec<usize> = (0..n).collect();
        let eigenvalues = decomposition.eigenvalues().select(Axis(0), &leading);
        let singular_values = decomposition.singular_values().select(Axis(0), &leading);
        let eofs = decomposition.eofs().select(Axis(1), &leading);
        let u = decomposition.u().select(Axis(1), &leading);
        let normalizer = decomposition.normalizer();

        // Loadings and PCs are paired so that pcs · loadingsᵀ = U Σ Vᵀ.
        let (loadings, pcs) = if config.scaled {
            (&eofs * &eigenvalues.mapv(f64::sqrt), &u * normalizer.sqrt())
        } else {
            (eofs, &u * &singular_values)
        };

        let rotation = match config.method {
            RotationMethod::None => Rotation {
                matrix: Array2::eye(n),
                status: RotationStatus::Converged { iterations: 0 },
            },
            RotationMethod::Varimax => varimax(loadings.view(), &config.varimax_options())?,
            RotationMethod::Promax { power } => promax(loadings.view(), power, &config.varimax_options())?,
        };

        let eofs_rot = loadings.dot(&rotation.matrix);
        let pcs_rot = match config.method {
            RotationMethod::Promax { .. } => {
                let backend = LinAlgBackendProvider::<f64>::new();
                let inverse = pseudo_inverse(&backend, rotation.matrix.view(), PINV_RCOND)
                    .map_err(|e| EofError::numerical("pseudo-inverse of the rotation matrix failed", e))?;
                pcs.dot(&inverse.t())
            }
            _ => pcs.dot(&rotation.matrix),
        };

        let variance: Array1<f64> = pcs_rot
            .columns()
            .into_iter()
            .zip(eofs_rot.columns())
            .map(|(pc, eof)| pc.dot(&pc) * eof.dot(&eof) / normalizer)
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| variance[b].total_cmp(&variance[a]));
        let mut rotation_matrix = rotation.matrix.select(Axis(1), &order);
        let mut eofs_sorted = eofs_rot.select(Axis(1), &order);
        let mut pcs_sorted = pcs_rot.select(Axis(1), &order);
        let variance = variance.select(Axis(0), &order);
        for j in 0..n {
            if dominant_sign(eofs_sorted.column(j)) < 0.0 {
                for m in [&mut eofs_sorted, &mut pcs_sorted, &mut rotation_matrix] {
                    m.column_mut(j).mapv_inplace(|x| -x);
                }
            }
        }

        let total_variance = decomposition.total_variance();
        let variance_fraction = if total_variance > 0.0 {
            variance.mapv(|v| v / total_variance)
        } else {
            Array1::zeros(n)
        };
        info!(
            "Rotated {} modes with {:?} in {:?} ({:?}).",
            n,
            config.method,
            start_time.elapsed(),
            rotation.status
        );
        Ok(RotatedResult {
            method: config.method,
            scaled: config.scaled,
            rotation: rotation_matrix,
            eofs: eofs_sorted,
            pcs: pcs_sorted,
            variance,
            variance_fraction,
            status: rotation.status,
            channels: solver.channels().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_varimax_recovers_simple_structure() {
        // Two clean clusters rotated by 30 degrees.
        let simple = array![[1.0, 0.0], [0.9, 0.0], [0.0, 1.0], [0.0, 0.8]];
        let (s, c) = (30.0_f64).to_radians().sin_cos();
        let mixing = array![[c, -s], [s, c]];
        let mixed = simple.dot(&mixing);
        let rotation = varimax(mixed.view(), &VarimaxOptions::default()).unwrap();
        assert!(rotation.status.is_converged());
        let rotated = mixed.dot(&rotation.matrix);
        for row in rotated.rows() {
            let small = row[0].abs().min(row[1].abs());
            assert!(small < 1e-6, "row {:?} is not simple", row);
        }
        let rtr = rotation.matrix.t().dot(&rotation.matrix);
        assert_abs_diff_eq!(rtr[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rtr[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_varimax_reports_non_convergence() {
        let loadings = array![[0.8, 0.3, 0.1], [0.7, -0.2, 0.4], [0.1, 0.9, -0.3], [0.2, 0.1, 0.95]];
        let options = VarimaxOptions { max_iter: 1, tol: 0.0, ..Default::default() };
        let rotation = varimax(loadings.view(), &options).unwrap();
        assert!(matches!(rotation.status, RotationStatus::NotConverged { iterations: 1, .. }));
    }

    #[test]
    fn test_promax_rejects_bad_power() {
        let loadings = array![[1.0, 0.0], [0.0, 1.0]];
        assert!(promax(loadings.view(), 0.5, &VarimaxOptions::default()).is_err());
    }
}
