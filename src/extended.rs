// src/extended.rs
//
// Extended EOF analysis: EOFs of a time-lagged embedding of one field. Row
// `r` of the embedding holds the field at times `r, r + 1, ..., r + L - 1`
// side by side, one lag per channel, so each extended EOF is a short
// space-time sequence of `L` spatial patterns.

use crate::config::{EofConfig, EofScaling, EofUnits, PcScaling};
use crate::diagnostics::ModeErrorEstimate;
use crate::error::{EofError, Result};
use crate::flatten::{flatten, SpatialIndex};
use crate::multivariate::FieldSpec;
use crate::solver::EofSolver;
use crate::weights::{compute_weights, WeightScheme};
use log::{debug, info};
use ndarray::{s, stack, Array1, Array2, ArrayD, ArrayView2, ArrayViewD, Axis, Ix2};

/// EOF analysis of a single field embedded over `lags` consecutive time steps.
///
/// The embedding has `T - lags + 1` rows. Spatial outputs carry a lag axis
/// right after the mode or time axis: `(n, lags, *spatial)`.
#[derive(Debug, Clone)]
pub struct ExtendedEof {
    solver: EofSolver,
    index: SpatialIndex,
    lags: usize,
    n_times: usize,
}

impl ExtendedEof {
    /// Builds the lagged embedding of `field` and decomposes it.
    ///
    /// Missing values are resolved on the whole field first, so every lag
    /// shares one set of valid points. Weights apply to each lag alike.
    pub fn new(field: FieldSpec<'_>, lags: usize, config: &EofConfig) -> Result<Self> {
        let flat = flatten(field.data.view(), field.mask.as_ref().map(|m| m.view()), config.missing_policy)?;
        let n_times = flat.n_times();
        if lags == 0 || lags >= n_times {
            return Err(EofError::InvalidInputShape(format!(
                "lag window must be between 1 and {} for {} time samples, got {}",
                n_times - 1,
                n_times,
                lags
            )));
        }
        let weights = compute_weights(&field.weights, flat.index())?;
        let n_embedded = n_times - lags + 1;
        debug!(
            "Embedding {} time samples over {} lags: {} x {} matrix.",
            n_times,
            lags,
            n_embedded,
            lags * flat.index().n_valid()
        );

        let lagged: Vec<FieldSpec<'_>> = (0..lags)
            .map(|lag| {
                let window: ArrayViewD<f64> = flat.data().slice(s![lag..lag + n_embedded, ..]).into_dyn();
                FieldSpec::new(window).with_weights(WeightScheme::Custom(weights.values().clone().into_dyn()))
            })
            .collect();
        let solver = EofSolver::new(&lagged, config)?;
        info!(
            "Extended EOF analysis over {} lags retained {} modes.",
            lags,
            solver.neofs()
        );
        let index = flat.index().clone();
        Ok(Self { solver, index, lags, n_times })
    }

    pub fn solver(&self) -> &EofSolver {
        &self.solver
    }

    pub fn lags(&self) -> usize {
        self.lags
    }

    /// Length of the original time axis.
    pub fn n_times(&self) -> usize {
        self.n_times
    }

    /// Rows of the embedding, `T - lags + 1`.
    pub fn n_embedded(&self) -> usize {
        self.n_times - self.lags + 1
    }

    pub fn neofs(&self) -> usize {
        self.solver.neofs()
    }

    /// Per-lag `(R, S_valid)` pieces scattered to the grid and stacked to `(R, lags, *spatial)`.
    fn stack_lags(&self, pieces: Vec<ArrayD<f64>>) -> Result<ArrayD<f64>> {
        let grids = pieces
            .into_iter()
            .map(|piece| {
                let piece = piece
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| EofError::ShapeMismatch(format!("lag block is not a matrix: {}", e)))?;
                self.index.unflatten(piece.view())
            })
            .collect::<Result<Vec<ArrayD<f64>>>>()?;
        let views: Vec<ArrayViewD<f64>> = grids.iter().map(|g| g.view()).collect();
        stack(Axis(1), &views).map_err(|e| EofError::ShapeMismatch(format!("stacking lags failed: {}", e)))
    }

    /// `(n, lags, *spatial)` extended EOFs.
    pub fn eofs(&self, n: Option<usize>, scaling: EofScaling, units: EofUnits) -> Result<ArrayD<f64>> {
        self.stack_lags(self.solver.eofs(n, scaling, units)?)
    }

    /// `(T - lags + 1, n)` principal components.
    pub fn pcs(&self, n: Option<usize>, scaling: PcScaling) -> Result<Array2<f64>> {
        self.solver.pcs(n, scaling)
    }

    pub fn eigenvalues(&self, n: Option<usize>) -> Result<Array1<f64>> {
        self.solver.eigenvalues(n)
    }

    pub fn variance_fraction(&self, n: Option<usize>) -> Result<Array1<f64>> {
        self.solver.variance_fraction(n)
    }

    pub fn total_anomaly_variance(&self) -> f64 {
        self.solver.total_anomaly_variance()
    }

    pub fn north_test(&self, n: Option<usize>, vf_scaled: bool) -> Result<Vec<ModeErrorEstimate>> {
        self.solver.north_test(n, vf_scaled)
    }

    /// `(n, lags, *spatial)` correlation of each lagged series with each PC.
    pub fn eofs_as_correlation(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        self.stack_lags(self.solver.eofs_as_correlation(n)?)
    }

    /// `(T - lags + 1, lags, *spatial)` embedding rebuilt from the leading `n`
    /// modes, each lag window's time mean added back.
    pub fn reconstructed_embedding(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        self.stack_lags(self.solver.reconstructed_field(n)?)
    }

    /// `(T, *spatial)` field rebuilt from the leading `n` modes.
    ///
    /// Every time step appears in up to `lags` rows of the embedding; their
    /// reconstructions are averaged.
    pub fn reconstructed_field(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        let pieces = self.solver.reconstructed_field(n)?;
        let n_embedded = self.n_embedded();
        let mut total = Array2::<f64>::zeros((self.n_times, self.index.n_valid()));
        let mut copies = Array1::<f64>::zeros(self.n_times);
        for (lag, piece) in pieces.iter().enumerate() {
            let piece: ArrayView2<f64> = piece
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| EofError::ShapeMismatch(format!("lag block is not a matrix: {}", e)))?;
            let mut rows = total.slice_mut(s![lag..lag + n_embedded, ..]);
            rows += &piece;
            copies.slice_mut(s![lag..lag + n_embedded]).mapv_inplace(|c| c + 1.0);
        }
        total /= &copies.insert_axis(Axis(1));
        self.index.unflatten(total.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissingPolicy;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// `(n_times, 3, 4)` field of two travelling waves plus a little noise.
    fn travelling_field(n_times: usize, seed: u64) -> Array3<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array3::from_shape_fn((n_times, 3, 4), |(t, i, j)| {
            let phase = 0.6 * t as f64 - 0.8 * j as f64;
            let slow = 0.15 * t as f64 + 0.5 * i as f64;
            2.0 + phase.sin() + 0.3 * (i as f64 + 1.0) * slow.cos() + 0.05 * rng.gen_range(-1.0..1.0)
        })
    }

    #[test]
    fn test_embedding_shapes_and_lag_layout() {
        let field = travelling_field(20, 1);
        let config = EofConfig { center: false, ..Default::default() };
        let eeof = ExtendedEof::new(FieldSpec::new(field.view().into_dyn()), 3, &config).unwrap();
        assert_eq!(eeof.n_embedded(), 18);
        assert_eq!(eeof.solver().channels().len(), 3);
        assert_eq!(eeof.solver().anomalies().dim(), (18, 36));

        // Row r, lag l holds the field at time r + l.
        let anomalies = eeof.solver().anomalies();
        for r in [0usize, 7, 17] {
            for lag in 0..3 {
                for p in 0..12 {
                    let (i, j) = (p / 4, p % 4);
                    assert_eq!(anomalies[[r, lag * 12 + p]], field[[r + lag, i, j]]);
                }
            }
        }

        let eofs = eeof.eofs(Some(4), EofScaling::Unscaled, EofUnits::Weighted).unwrap();
        assert_eq!(eofs.shape(), &[4, 3, 3, 4]);
        assert_eq!(eeof.pcs(Some(4), PcScaling::Unscaled).unwrap().dim(), (18, 4));
        assert_eq!(eeof.eofs_as_correlation(Some(2)).unwrap().shape(), &[2, 3, 3, 4]);
        assert_eq!(eeof.reconstructed_embedding(Some(2)).unwrap().shape(), &[18, 3, 3, 4]);
    }

    #[test]
    fn test_full_reconstruction_round_trips_the_field() {
        let mut field = travelling_field(24, 2);
        for t in 0..24 {
            field[[t, 1, 2]] = f64::NAN;
        }
        let spec = FieldSpec::new(field.view().into_dyn()).with_weights(WeightScheme::Latitude {
            latitudes: array![-30.0, 0.0, 60.0],
            axis: 0,
        });
        let eeof = ExtendedEof::new(spec, 4, &EofConfig::default()).unwrap();
        let rebuilt = eeof.reconstructed_field(None).unwrap();
        assert_eq!(rebuilt.shape(), &[24, 3, 4]);
        for t in 0..24 {
            for i in 0..3 {
                for j in 0..4 {
                    if (i, j) == (1, 2) {
                        assert!(rebuilt[[t, i, j]].is_nan());
                    } else {
                        assert_abs_diff_eq!(rebuilt[[t, i, j]], field[[t, i, j]], epsilon = 1e-9);
                    }
                }
            }
        }
        let embedding = eeof.reconstructed_embedding(None).unwrap();
        assert_abs_diff_eq!(embedding[[5, 2, 0, 3]], field[[7, 0, 3]], epsilon = 1e-9);
    }

    #[test]
    fn test_single_travelling_wave_needs_two_modes() {
        let field = Array3::from_shape_fn((40, 2, 6), |(t, _, j)| (0.5 * t as f64 - 0.9 * j as f64).sin());
        let eeof = ExtendedEof::new(FieldSpec::new(field.view().into_dyn()), 5, &EofConfig::default()).unwrap();
        let vf = eeof.variance_fraction(Some(2)).unwrap();
        assert_abs_diff_eq!(vf.sum(), 1.0, epsilon = 1e-9);
        assert_eq!(eeof.north_test(Some(2), true).unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_bad_lag_windows_and_partial_missingness() {
        let field = travelling_field(10, 3).into_dyn();
        for lags in [0usize, 10, 11] {
            assert!(matches!(
                ExtendedEof::new(FieldSpec::new(field.view()), lags, &EofConfig::default()),
                Err(EofError::InvalidInputShape(_))
            ));
        }
        assert!(ExtendedEof::new(FieldSpec::new(field.view()), 9, &EofConfig::default()).is_ok());

        let mut gappy = travelling_field(10, 4);
        gappy[[6, 0, 0]] = f64::NAN;
        let gappy = gappy.into_dyn();
        assert!(matches!(
            ExtendedEof::new(FieldSpec::new(gappy.view()), 3, &EofConfig::default()),
            Err(EofError::InconsistentMissingness { .. })
        ));
        let config = EofConfig { missing_policy: MissingPolicy::Lenient, ..Default::default() };
        let lenient = ExtendedEof::new(FieldSpec::new(gappy.view()), 3, &config).unwrap();
        assert_eq!(lenient.solver().channels().total_width(), 3 * 11);
    }
}
