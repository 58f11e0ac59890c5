// src/solver.rs
//
// Analysis objects. `EofSolver` runs combine -> decompose once and answers
// every query from the stored, immutable state. `Eof` and `MultivariateEof`
// are thin single-field and per-field front ends over it.

use crate::config::{EofConfig, EofScaling, EofUnits, PcScaling};
use crate::decomposition::{center_columns, decompose, DecompositionOptions, DecompositionResult};
use crate::diagnostics::{correlation_map, covariance_map, north_errors, project, reconstruct, ModeErrorEstimate};
use crate::error::{EofError, Result};
use crate::multivariate::{combine, ChannelTable, FieldSpec};
use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayD};

/// Shared state of an EOF analysis over one or more fields.
#[derive(Debug, Clone)]
pub struct EofSolver {
    config: EofConfig,
    channels: ChannelTable,
    /// Unweighted anomalies, `(T, S)`. Only centered if `config.center`.
    anomalies: Array2<f64>,
    /// Unweighted time mean, present if `config.center`.
    time_mean: Option<Array1<f64>>,
    decomposition: DecompositionResult,
    neff: f64,
}

impl EofSolver {
    /// Flattens, weights and combines `fields`, then decomposes the result.
    pub fn new(fields: &[FieldSpec<'_>], config: &EofConfig) -> Result<Self> {
        let start_time = std::time::Instant::now();
        let (mut anomalies, weighted, channels) = combine(fields, config.missing_policy)?.into_parts();
        let options = DecompositionOptions {
            center: config.center,
            ddof: config.ddof,
            neofs: config.neofs,
            strategy: config.svd_strategy,
        };
        let decomposition = decompose(weighted.view(), &options)?;
        let time_mean = if config.center {
            Some(center_columns(&mut anomalies)?)
        } else {
            None
        };
        if !channels.is_uniformly_weighted() {
            debug!("Non-uniform weights: unweighted EOFs are orthogonal in direction only.");
        }
        let neff = config.neff.unwrap_or(anomalies.nrows() as f64);
        if !(neff.is_finite() && neff > 0.0) {
            return Err(EofError::InvalidInputShape(format!(
                "effective sample size must be positive, got {}",
                neff
            )));
        }
        info!(
            "EOF analysis of {} field(s): {} time samples, {} valid points, {} modes retained in {:?}.",
            channels.len(),
            anomalies.nrows(),
            anomalies.ncols(),
            decomposition.n_modes(),
            start_time.elapsed()
        );
        Ok(Self {
            config: config.clone(),
            channels,
            anomalies,
            time_mean,
            decomposition,
            neff,
        })
    }

    pub fn config(&self) -> &EofConfig {
        &self.config
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn decomposition(&self) -> &DecompositionResult {
        &self.decomposition
    }

    /// Unweighted anomalies the maps are computed against.
    pub fn anomalies(&self) -> &Array2<f64> {
        &self.anomalies
    }

    pub fn time_mean(&self) -> Option<&Array1<f64>> {
        self.time_mean.as_ref()
    }

    /// Number of retained modes.
    pub fn neofs(&self) -> usize {
        self.decomposition.n_modes()
    }

    pub fn neff(&self) -> f64 {
        self.neff
    }

    fn modes(&self, n: Option<usize>) -> Result<usize> {
        let retained = self.neofs();
        match n {
            None => Ok(retained),
            Some(k) if k >= 1 && k <= retained => Ok(k),
            Some(k) => Err(EofError::InvalidInputShape(format!(
                "requested {} modes, but only {} are retained",
                k, retained
            ))),
        }
    }

    /// EOFs per field, each `(n, *spatial)`, with NaN at excluded points.
    pub fn eofs(&self, n: Option<usize>, scaling: EofScaling, units: EofUnits) -> Result<Vec<ArrayD<f64>>> {
        let k = self.modes(n)?;
        let scaled = self.decomposition.scaled_eofs(scaling);
        let mut patterns = scaled.slice(s![.., ..k]).t().to_owned();
        if units == EofUnits::Unweighted {
            self.channels.unweight_columns(&mut patterns);
        }
        self.channels.split_unflatten(patterns.view())
    }

    /// `(T, n)` principal components.
    pub fn pcs(&self, n: Option<usize>, scaling: PcScaling) -> Result<Array2<f64>> {
        let k = self.modes(n)?;
        Ok(self.decomposition.pcs(scaling).slice(s![.., ..k]).to_owned())
    }

    pub fn eigenvalues(&self, n: Option<usize>) -> Result<Array1<f64>> {
        let k = self.modes(n)?;
        Ok(self.decomposition.eigenvalues().slice(s![..k]).to_owned())
    }

    pub fn variance_fraction(&self, n: Option<usize>) -> Result<Array1<f64>> {
        let k = self.modes(n)?;
        Ok(self.decomposition.variance_fraction().slice(s![..k]).to_owned())
    }

    /// Total variance of the weighted anomalies.
    pub fn total_anomaly_variance(&self) -> f64 {
        self.decomposition.total_variance()
    }

    /// Correlation of each point's (unweighted) series with each PC, per field.
    pub fn eofs_as_correlation(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        let pcs = self.pcs(n, PcScaling::Unscaled)?;
        let maps = correlation_map(self.anomalies.view(), pcs.view())?;
        self.channels.split_unflatten(maps.view())
    }

    /// Covariance of each point's (unweighted) series with each scaled PC, per field.
    pub fn eofs_as_covariance(&self, n: Option<usize>, pcscaling: PcScaling) -> Result<Vec<ArrayD<f64>>> {
        let pcs = self.pcs(n, pcscaling)?;
        let maps = covariance_map(self.anomalies.view(), pcs.view(), self.config.ddof)?;
        self.channels.split_unflatten(maps.view())
    }

    /// North's rule-of-thumb errors. `vf_scaled` expresses them as variance fractions.
    pub fn north_test(&self, n: Option<usize>, vf_scaled: bool) -> Result<Vec<ModeErrorEstimate>> {
        let eigenvalues = self.eigenvalues(n)?;
        let total = vf_scaled.then(|| self.total_anomaly_variance());
        north_errors(eigenvalues.view(), self.neff, total)
    }

    fn reconstruct_physical(&self, modes: &[usize], add_mean: bool) -> Result<Vec<ArrayD<f64>>> {
        let mut rebuilt = reconstruct(&self.decomposition, modes)?;
        self.channels.unweight_columns(&mut rebuilt);
        if add_mean {
            if let Some(mean) = &self.time_mean {
                rebuilt += mean;
            }
        }
        self.channels.split_unflatten(rebuilt.view())
    }

    /// Field rebuilt from the leading `n` modes, time mean added back.
    pub fn reconstructed_field(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        let k = self.modes(n)?;
        let modes: Vec<usize> = (0..k).collect();
        self.reconstruct_physical(&modes, true)
    }

    /// Field rebuilt from an arbitrary subset of modes, time mean added back.
    pub fn reconstruct_modes(&self, modes: &[usize]) -> Result<Vec<ArrayD<f64>>> {
        self.reconstruct_physical(modes, true)
    }

    /// Anomalies rebuilt from the leading `n` modes.
    pub fn reconstructed_anomalies(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        let k = self.modes(n)?;
        let modes: Vec<usize> = (0..k).collect();
        self.reconstruct_physical(&modes, false)
    }

    /// Projects new fields onto the leading `n` EOFs, giving `(R, n)` pseudo-PCs.
    ///
    /// Fields must share the stored spatial layouts. The stored time mean is
    /// removed and, if `weighted`, the stored weights applied first.
    pub fn project_fields(
        &self,
        fields: &[FieldSpec<'_>],
        n: Option<usize>,
        scaling: EofScaling,
        weighted: bool,
    ) -> Result<Array2<f64>> {
        let k = self.modes(n)?;
        let mut data = self.channels.gather_fields(fields)?;
        if let Some(mean) = &self.time_mean {
            data -= mean;
        }
        if weighted {
            data *= &self.channels.combined_weights();
        }
        let eofs = self.decomposition.scaled_eofs(scaling);
        debug!("Projecting {} time samples onto {} EOFs.", data.nrows(), k);
        project(data.view(), eofs.slice(s![.., ..k]))
    }

    /// Weight multipliers per field, on each field's spatial grid.
    pub fn weights(&self) -> Result<Vec<ArrayD<f64>>> {
        self.channels
            .channels()
            .iter()
            .map(|c| c.index.unflatten_row(c.weights.values().view()))
            .collect()
    }
}

fn single(mut pieces: Vec<ArrayD<f64>>) -> Result<ArrayD<f64>> {
    pieces
        .pop()
        .ok_or_else(|| EofError::ShapeMismatch("analysis produced no field output".to_string()))
}

/// EOF analysis of a single field.
#[derive(Debug, Clone)]
pub struct Eof {
    solver: EofSolver,
}

impl Eof {
    pub fn new(field: FieldSpec<'_>, config: &EofConfig) -> Result<Self> {
        Ok(Self { solver: EofSolver::new(&[field], config)? })
    }

    pub fn solver(&self) -> &EofSolver {
        &self.solver
    }

    /// `(n, *spatial)` EOFs.
    pub fn eofs(&self, n: Option<usize>, scaling: EofScaling, units: EofUnits) -> Result<ArrayD<f64>> {
        single(self.solver.eofs(n, scaling, units)?)
    }

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

    pub fn eofs_as_correlation(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        single(self.solver.eofs_as_correlation(n)?)
    }

    pub fn eofs_as_covariance(&self, n: Option<usize>, pcscaling: PcScaling) -> Result<ArrayD<f64>> {
        single(self.solver.eofs_as_covariance(n, pcscaling)?)
    }

    pub fn north_test(&self, n: Option<usize>, vf_scaled: bool) -> Result<Vec<ModeErrorEstimate>> {
        self.solver.north_test(n, vf_scaled)
    }

    pub fn reconstructed_field(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        single(self.solver.reconstructed_field(n)?)
    }

    pub fn reconstruct_modes(&self, modes: &[usize]) -> Result<ArrayD<f64>> {
        single(self.solver.reconstruct_modes(modes)?)
    }

    pub fn reconstructed_anomalies(&self, n: Option<usize>) -> Result<ArrayD<f64>> {
        single(self.solver.reconstructed_anomalies(n)?)
    }

    /// Pseudo-PCs of `field`; a single spatial slice yields one row.
    pub fn project_field(&self, field: FieldSpec<'_>, n: Option<usize>, scaling: EofScaling, weighted: bool) -> Result<Array2<f64>> {
        self.solver.project_fields(&[field], n, scaling, weighted)
    }

    pub fn weights(&self) -> Result<ArrayD<f64>> {
        single(self.solver.weights()?)
    }

    pub fn neofs(&self) -> usize {
        self.solver.neofs()
    }

    pub fn neff(&self) -> f64 {
        self.solver.neff()
    }
}

/// EOF analysis of several fields sharing a time axis.
///
/// Spatial outputs come back as one array per input field, in input order.
#[derive(Debug, Clone)]
pub struct MultivariateEof {
    solver: EofSolver,
}

impl MultivariateEof {
    pub fn new(fields: &[FieldSpec<'_>], config: &EofConfig) -> Result<Self> {
        Ok(Self { solver: EofSolver::new(fields, config)? })
    }

    pub fn solver(&self) -> &EofSolver {
        &self.solver
    }

    pub fn n_fields(&self) -> usize {
        self.solver.channels().len()
    }

    pub fn eofs(&self, n: Option<usize>, scaling: EofScaling, units: EofUnits) -> Result<Vec<ArrayD<f64>>> {
        self.solver.eofs(n, scaling, units)
    }

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

    pub fn eofs_as_correlation(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        self.solver.eofs_as_correlation(n)
    }

    pub fn eofs_as_covariance(&self, n: Option<usize>, pcscaling: PcScaling) -> Result<Vec<ArrayD<f64>>> {
        self.solver.eofs_as_covariance(n, pcscaling)
    }

    pub fn north_test(&self, n: Option<usize>, vf_scaled: bool) -> Result<Vec<ModeErrorEstimate>> {
        self.solver.north_test(n, vf_scaled)
    }

    pub fn reconstructed_field(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        self.solver.reconstructed_field(n)
    }

    pub fn reconstruct_modes(&self, modes: &[usize]) -> Result<Vec<ArrayD<f64>>> {
        self.solver.reconstruct_modes(modes)
    }

    pub fn reconstructed_anomalies(&self, n: Option<usize>) -> Result<Vec<ArrayD<f64>>> {
        self.solver.reconstructed_anomalies(n)
    }

    pub fn project_fields(&self, fields: &[FieldSpec<'_>], n: Option<usize>, scaling: EofScaling, weighted: bool) -> Result<Array2<f64>> {
        self.solver.project_fields(fields, n, scaling, weighted)
    }

    pub fn weights(&self) -> Result<Vec<ArrayD<f64>>> {
        self.solver.weights()
    }

    pub fn neofs(&self) -> usize {
        self.solver.neofs()
    }

    pub fn neff(&self) -> f64 {
        self.solver.neff()
    }
}
