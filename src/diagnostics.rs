// src/diagnostics.rs
//
// Quantities derived from a decomposition: covariance and correlation maps,
// low-rank reconstruction, projection of new data, North's rule-of-thumb
// errors, and the numerical checks used by the tests.

use crate::decomposition::DecompositionResult;
use crate::error::{EofError, Result};
use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// North et al. (1982) typical error for one eigenvalue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeErrorEstimate {
    pub mode: usize,
    /// Eigenvalue, or variance fraction when errors are fraction-scaled.
    pub eigenvalue: f64,
    pub error: f64,
    /// `λ_k - λ_{k+1} >= error_k`. `None` for the last mode, which has no neighbour.
    pub separated_from_next: Option<bool>,
}

/// `(k, S)` covariance between each point's series and each PC: `Pᵀ X / (T - ddof)`.
///
/// With unit-norm PCs and unweighted anomalies this equals the physical-unit
/// EOF scaled by `σ_k / (T - ddof)`.
pub fn covariance_map(anomalies: ArrayView2<f64>, pcs: ArrayView2<f64>, ddof: usize) -> Result<Array2<f64>> {
    let n_times = anomalies.nrows();
    if pcs.nrows() != n_times {
        return Err(EofError::ShapeMismatch(format!(
            "PCs have {} time samples but the anomalies have {}",
            pcs.nrows(),
            n_times
        )));
    }
    if n_times <= ddof {
        return Err(EofError::InvalidInputShape(format!(
            "T - ddof must be positive (T = {}, ddof = {})",
            n_times, ddof
        )));
    }
    let normalizer = (n_times - ddof) as f64;
    Ok(pcs.t().dot(&anomalies) / normalizer)
}

/// Norm of `series` about its mean, and its raw norm.
fn series_norms(series: ArrayView1<f64>) -> (f64, f64) {
    let mean = series.sum() / series.len() as f64;
    let centered = series.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>().sqrt();
    let raw = series.dot(&series).sqrt();
    (centered, raw)
}

/// Flags series whose centered norm is within rounding of zero.
///
/// Rounding in the mean removal leaves up to about `n·ε` of the series' own
/// raw norm, and anything below `n·ε` of the largest centered norm in the set
/// cannot be told apart from it. A set whose norms are all zero flags only
/// exact zeros.
fn constant_series(norms: &[(f64, f64)], n_times: usize) -> Vec<bool> {
    let largest = norms.iter().map(|&(centered, _)| centered).fold(0.0_f64, f64::max);
    let relative = n_times as f64 * f64::EPSILON;
    norms
        .iter()
        .map(|&(centered, raw)| centered <= relative * raw.max(largest))
        .collect()
}

/// `(k, S)` Pearson correlation between each point's series and each PC.
///
/// NaN where either series has no variance. Constancy is judged relative to
/// the magnitudes involved, so the result does not depend on the physical
/// units of the field. Points are processed in parallel.
pub fn correlation_map(anomalies: ArrayView2<f64>, pcs: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n_times = anomalies.nrows();
    if pcs.nrows() != n_times {
        return Err(EofError::ShapeMismatch(format!(
            "PCs have {} time samples but the anomalies have {}",
            pcs.nrows(),
            n_times
        )));
    }
    if n_times < 2 {
        return Err(EofError::InvalidInputShape("correlation needs at least 2 time samples".to_string()));
    }
    let pc_centered = pcs.to_owned() - &pcs.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(pcs.ncols()));
    let pc_norms: Vec<(f64, f64)> = pcs.columns().into_iter().map(series_norms).collect();
    let pc_constant = constant_series(&pc_norms, n_times);

    let point_norms: Vec<(f64, f64)> = anomalies.axis_iter(Axis(1)).into_par_iter().map(series_norms).collect();
    let point_constant = constant_series(&point_norms, n_times);

    let mut maps = Array2::<f64>::zeros((pcs.ncols(), anomalies.ncols()));
    maps.axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(anomalies.axis_iter(Axis(1)).into_par_iter())
        .zip(point_norms.par_iter().zip(point_constant.par_iter()))
        .for_each(|((mut out, series), (&(norm, _), &constant))| {
            if constant {
                out.fill(f64::NAN);
                return;
            }
            let mean = series.sum() / n_times as f64;
            let centered = series.mapv(|x| x - mean);
            for (k, pc) in pc_centered.columns().into_iter().enumerate() {
                out[k] = if pc_constant[k] {
                    f64::NAN
                } else {
                    (centered.dot(&pc) / (norm * pc_norms[k].0)).clamp(-1.0, 1.0)
                };
            }
        });
    trace!(
        "Correlation maps computed for {} modes over {} points ({} constant).",
        pcs.ncols(),
        anomalies.ncols(),
        point_constant.iter().filter(|&&c| c).count()
    );
    Ok(maps)
}

/// `(T, S)` sum of `PC_k ⊗ EOF_k` over `modes`, in the decomposed (weighted) space.
pub fn reconstruct(result: &DecompositionResult, modes: &[usize]) -> Result<Array2<f64>> {
    if modes.is_empty() {
        return Err(EofError::InvalidInputShape("at least one mode is needed for reconstruction".to_string()));
    }
    if let Some(&bad) = modes.iter().find(|&&m| m >= result.n_modes()) {
        return Err(EofError::InvalidInputShape(format!(
            "mode {} is out of range, {} modes are retained",
            bad,
            result.n_modes()
        )));
    }
    let u = result.u().select(Axis(1), modes);
    let sv = result.singular_values().select(Axis(0), modes);
    let v = result.eofs().select(Axis(1), modes);
    debug!("Reconstructing from {} of {} modes.", modes.len(), result.n_modes());
    Ok((u * &sv).dot(&v.t()))
}

/// Projects `(R, S)` anomalies onto `(S, k)` EOFs, giving `(R, k)` pseudo-PCs.
pub fn project(anomalies: ArrayView2<f64>, eofs: ArrayView2<f64>) -> Result<Array2<f64>> {
    if anomalies.ncols() != eofs.nrows() {
        return Err(EofError::ShapeMismatch(format!(
            "field has {} spatial points but the EOFs have {}",
            anomalies.ncols(),
            eofs.nrows()
        )));
    }
    if anomalies.iter().any(|x| x.is_nan()) {
        return Err(EofError::ShapeMismatch(
            "field to project has missing values at points that are valid in the analysis".to_string(),
        ));
    }
    Ok(anomalies.dot(&eofs))
}

/// North's rule-of-thumb errors `λ_k · sqrt(2 / neff)`.
///
/// When `total_variance` is given, eigenvalues and errors are both divided
/// by it, giving errors on variance fractions.
pub fn north_errors(eigenvalues: ArrayView1<f64>, neff: f64, total_variance: Option<f64>) -> Result<Vec<ModeErrorEstimate>> {
    if !(neff.is_finite() && neff > 0.0) {
        return Err(EofError::InvalidInputShape(format!("effective sample size must be positive, got {}", neff)));
    }
    let scale = match total_variance {
        Some(tv) if tv > 0.0 => 1.0 / tv,
        Some(tv) => {
            return Err(EofError::InvalidInputShape(format!(
                "cannot scale errors by a total variance of {}",
                tv
            )))
        }
        None => 1.0,
    };
    let factor = (2.0 / neff).sqrt();
    let scaled: Vec<f64> = eigenvalues.iter().map(|&lam| lam * scale).collect();
    Ok(scaled
        .iter()
        .enumerate()
        .map(|(mode, &lam)| {
            let error = lam * factor;
            ModeErrorEstimate {
                mode,
                eigenvalue: lam,
                error,
                separated_from_next: scaled.get(mode + 1).map(|&next| lam - next >= error),
            }
        })
        .collect())
}

/// Index pairs `(k, k + 1)` whose eigenvalues are closer than the typical error.
pub fn ill_separated_pairs(estimates: &[ModeErrorEstimate]) -> Vec<(usize, usize)> {
    estimates
        .iter()
        .filter(|e| e.separated_from_next == Some(false))
        .map(|e| (e.mode, e.mode + 1))
        .collect()
}

// --- Numerical checks ---

/// Frobenius norm, `0.0` for an empty matrix.
pub fn frobenius_norm(matrix: ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// `‖I - QᵀQ‖_F`.
pub fn orthogonality_error(q_matrix: ArrayView2<f64>) -> Option<f64> {
    if q_matrix.nrows() == 0 || q_matrix.ncols() == 0 {
        return None;
    }
    let qtq = q_matrix.t().dot(&q_matrix);
    let diff = Array2::<f64>::eye(qtq.nrows()) - qtq;
    Some(frobenius_norm(diff.view()))
}

/// Relative error `‖A - U diag(s) Vᵀ‖_F / ‖A‖_F`, with `v` laid out `(S, k)`.
pub fn reconstruction_error(
    original: ArrayView2<f64>,
    u: ArrayView2<f64>,
    s: ArrayView1<f64>,
    v: ArrayView2<f64>,
) -> Option<f64> {
    if original.is_empty() || u.ncols() != s.len() || v.ncols() != s.len() {
        return None;
    }
    if u.nrows() != original.nrows() || v.nrows() != original.ncols() {
        return None;
    }
    let rebuilt = (&u * &s).dot(&v.t());
    let norm_diff = frobenius_norm((&original - &rebuilt).view());
    let norm_original = frobenius_norm(original);
    if norm_original < 1e-12 {
        Some(if norm_diff < 1e-12 { 0.0 } else { f64::INFINITY })
    } else {
        Some(norm_diff / norm_original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::{decompose, DecompositionOptions};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample_matrix() -> Array2<f64> {
        array![
            [1.0, 2.0, 0.5, -1.0],
            [2.0, -1.0, 1.5, 0.0],
            [0.0, 0.5, -2.0, 1.0],
            [3.0, 1.0, 0.0, 2.0],
            [-1.0, 0.0, 1.0, -0.5],
            [0.5, 1.5, -0.5, 0.5]
        ]
    }

    #[test]
    fn test_north_errors_formula_and_flags() {
        let eig = array![10.0, 9.0, 2.0];
        let est = north_errors(eig.view(), 50.0, None).unwrap();
        let factor = (2.0_f64 / 50.0).sqrt();
        assert_abs_diff_eq!(est[0].error, 10.0 * factor, epsilon = 1e-12);
        // 10 - 9 = 1 < 2.0, 9 - 2 = 7 > 1.8
        assert_eq!(est[0].separated_from_next, Some(false));
        assert_eq!(est[1].separated_from_next, Some(true));
        assert_eq!(est[2].separated_from_next, None);
        assert_eq!(ill_separated_pairs(&est), vec![(0, 1)]);

        let scaled = north_errors(eig.view(), 50.0, Some(20.0)).unwrap();
        assert_abs_diff_eq!(scaled[0].eigenvalue, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[0].error, est[0].error / 20.0, epsilon = 1e-12);
        assert!(north_errors(eig.view(), 0.0, None).is_err());
    }

    #[test]
    fn test_correlation_map_nan_for_constant_points() {
        let anomalies = array![[1.0, 5.0, 2.0], [2.0, 5.0, 4.0], [3.0, 5.0, 6.0]];
        let pcs = array![[-1.0], [0.0], [1.0]];
        let corr = correlation_map(anomalies.view(), pcs.view()).unwrap();
        assert_abs_diff_eq!(corr[[0, 0]], 1.0, epsilon = 1e-12);
        assert!(corr[[0, 1]].is_nan());
        assert_abs_diff_eq!(corr[[0, 2]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_correlation_map_is_independent_of_field_units() {
        let n = 30;
        let wave = Array1::from_shape_fn(n, |t| (0.7 * t as f64).sin());
        let mut anomalies = Array2::<f64>::zeros((n, 3));
        anomalies.column_mut(0).assign(&(&wave * 1e-7));
        anomalies.column_mut(1).fill(0.1);
        anomalies.column_mut(2).assign(&(&wave * -3e-9 + 2.5e-8));
        let pcs = wave.clone().insert_axis(Axis(1));

        let corr = correlation_map(anomalies.view(), pcs.view()).unwrap();
        assert_abs_diff_eq!(corr[[0, 0]], 1.0, epsilon = 1e-12);
        // A constant point stays missing even when its mean dwarfs the other series.
        assert!(corr[[0, 1]].is_nan());
        assert_abs_diff_eq!(corr[[0, 2]], -1.0, epsilon = 1e-12);

        let tiny_pc = &pcs * 1e-9;
        let corr = correlation_map(anomalies.view(), tiny_pc.view()).unwrap();
        assert_abs_diff_eq!(corr[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_full_reconstruction_recovers_anomalies() {
        let x = sample_matrix();
        let result = decompose(x.view(), &DecompositionOptions::default()).unwrap();
        let modes: Vec<usize> = (0..result.n_modes()).collect();
        let rebuilt = reconstruct(&result, &modes).unwrap();
        let mean = x.mean_axis(Axis(0)).unwrap();
        let anomalies = &x - &mean;
        for (a, b) in anomalies.iter().zip(rebuilt.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        assert!(reconstruct(&result, &[result.n_modes()]).is_err());
        let err = reconstruction_error(anomalies.view(), result.u().view(), result.singular_values().view(), result.eofs().view());
        assert!(err.unwrap() < 1e-10);
    }

    #[test]
    fn test_covariance_map_matches_scaled_eofs() {
        let x = sample_matrix();
        let result = decompose(x.view(), &DecompositionOptions::default()).unwrap();
        let anomalies = &x - &x.mean_axis(Axis(0)).unwrap();
        let cov = covariance_map(anomalies.view(), result.u().view(), 1).unwrap();
        let n = result.normalizer();
        for k in 0..result.n_modes() {
            for s in 0..x.ncols() {
                let expected = result.eofs()[[s, k]] * result.singular_values()[k] / n;
                assert_abs_diff_eq!(cov[[k, s]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_projection_rejects_mismatch_and_missing() {
        let eofs = Array2::<f64>::eye(3);
        assert!(matches!(project(Array2::zeros((2, 4)).view(), eofs.view()), Err(EofError::ShapeMismatch(_))));
        let with_nan = array![[1.0, f64::NAN, 0.0]];
        assert!(matches!(project(with_nan.view(), eofs.view()), Err(EofError::ShapeMismatch(_))));
    }

    #[test]
    fn test_numerical_checks() {
        let q = array![[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        assert_abs_diff_eq!(orthogonality_error(q.view()).unwrap(), 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(frobenius_norm(array![[3.0, 4.0]].view()), 5.0, epsilon = 1e-15);
        assert!(orthogonality_error(Array2::<f64>::zeros((0, 0)).view()).is_none());
    }
}
