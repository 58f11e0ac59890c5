// src/weights.rs
//
// Per-point weight multipliers. The data matrix is multiplied column-wise by
// these multipliers before decomposition, so a multiplier `w` corresponds to
// a covariance weight of `w²`. Latitude and area schemes therefore produce
// square roots of `cos(latitude)` and of the normalised cell area.

use crate::error::{EofError, Result};
use crate::flatten::SpatialIndex;
use float_cmp::approx_eq;
use log::debug;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMut2, IxDyn};
use serde::{Deserialize, Serialize};

/// How per-point weights are obtained.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WeightScheme {
    /// No weighting. Identical to `Equal`.
    #[default]
    None,
    Equal,
    /// `sqrt(cos(latitude))`, with `latitudes` in degrees lying along
    /// spatial axis `axis` (0 is the first axis after time).
    Latitude { latitudes: Array1<f64>, axis: usize },
    /// `sqrt(area / max(area))` for grid-cell areas broadcastable to the grid.
    Area { areas: ArrayD<f64> },
    /// Multipliers supplied by the caller, broadcastable to the grid, used as-is.
    Custom(ArrayD<f64>),
}

/// Non-negative multipliers aligned with the valid points of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    values: Array1<f64>,
}

impl WeightVector {
    /// Wraps multipliers that are already aligned to valid points.
    pub fn new(values: Array1<f64>) -> Result<Self> {
        validate_non_negative(values.iter())?;
        Ok(Self { values })
    }

    pub fn ones(n: usize) -> Self {
        Self { values: Array1::ones(n) }
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every multiplier is the same.
    pub fn is_uniform(&self) -> bool {
        match self.values.get(0) {
            Some(&first) => self.values.iter().all(|&w| approx_eq!(f64, w, first, ulps = 4)),
            None => true,
        }
    }

    /// Divides each column by its multiplier, giving NaN where the multiplier is zero.
    pub fn unweight_columns(&self, mut matrix: ArrayViewMut2<f64>) {
        for (mut col, &w) in matrix.columns_mut().into_iter().zip(self.values.iter()) {
            if w > 0.0 {
                col.mapv_inplace(|x| x / w);
            } else {
                col.fill(f64::NAN);
            }
        }
    }
}

fn validate_non_negative<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> Result<()> {
    for &w in values {
        if !w.is_finite() {
            return Err(EofError::InvalidWeight(format!("weight {} is not finite", w)));
        }
        if w < 0.0 {
            return Err(EofError::InvalidWeight(format!("weight {} is negative", w)));
        }
    }
    Ok(())
}

/// `sqrt(cos(lat))` for latitudes in degrees. Values of `cos` below machine
/// epsilon are clamped to zero so that the poles get exactly zero weight.
pub fn latitude_weights(latitudes: ArrayView1<f64>) -> Result<Array1<f64>> {
    let mut out = Array1::zeros(latitudes.len());
    for (w, &lat) in out.iter_mut().zip(latitudes.iter()) {
        if !lat.is_finite() || lat.abs() > 90.0 {
            return Err(EofError::InvalidWeight(format!("latitude {} is outside [-90, 90]", lat)));
        }
        let c = lat.to_radians().cos();
        *w = if c < f64::EPSILON { 0.0 } else { c.sqrt() };
    }
    Ok(out)
}

/// Spherical grid-cell areas on a unit sphere, `(sin φ₂ − sin φ₁)·|λ₂ − λ₁|`.
///
/// `lat_bounds` is `(nlat, 2)` and `lon_bounds` is `(nlon, 2)`, both in
/// degrees. The result has shape `(nlat, nlon)`.
pub fn cell_areas(lat_bounds: ArrayView2<f64>, lon_bounds: ArrayView2<f64>) -> Result<Array2<f64>> {
    if lat_bounds.ncols() != 2 || lon_bounds.ncols() != 2 {
        return Err(EofError::InvalidInputShape(format!(
            "cell bounds must have 2 columns, got {:?} and {:?}",
            lat_bounds.dim(),
            lon_bounds.dim()
        )));
    }
    for &lat in lat_bounds.iter() {
        if !lat.is_finite() || lat.abs() > 90.0 {
            return Err(EofError::InvalidWeight(format!("latitude bound {} is outside [-90, 90]", lat)));
        }
    }
    let lat_extent: Array1<f64> = lat_bounds
        .rows()
        .into_iter()
        .map(|b| (b[1].to_radians().sin() - b[0].to_radians().sin()).abs())
        .collect();
    let lon_extent: Array1<f64> = lon_bounds
        .rows()
        .into_iter()
        .map(|b| (b[1] - b[0]).abs().to_radians())
        .collect();
    Ok(Array2::from_shape_fn((lat_extent.len(), lon_extent.len()), |(i, j)| lat_extent[i] * lon_extent[j]))
}

/// Broadcasts `weights` onto `spatial_shape`.
///
/// Broadcasting rule: the weight array is aligned with the trailing spatial
/// dimensions; each of its axes must either equal the matching spatial
/// extent or be 1 (the NumPy rule). A `(nlat, 1)` array therefore spreads a
/// per-latitude weight across longitude on a `(nlat, nlon)` grid, and a
/// `(nlon,)` array is repeated for every latitude.
pub fn broadcast_to_grid(weights: ArrayViewD<f64>, spatial_shape: &[usize]) -> Result<ArrayD<f64>> {
    weights
        .broadcast(IxDyn(spatial_shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| EofError::WeightShape {
            weights: weights.shape().to_vec(),
            spatial: spatial_shape.to_vec(),
        })
}

fn latitude_grid(latitudes: &Array1<f64>, axis: usize, spatial_shape: &[usize]) -> Result<ArrayD<f64>> {
    let shape_error = || EofError::WeightShape {
        weights: vec![latitudes.len()],
        spatial: spatial_shape.to_vec(),
    };
    if axis >= spatial_shape.len() || spatial_shape[axis] != latitudes.len() {
        return Err(shape_error());
    }
    let per_lat = latitude_weights(latitudes.view())?;
    // Place the latitude vector on its own axis with unit extents elsewhere.
    let mut placed_shape = vec![1usize; spatial_shape.len()];
    placed_shape[axis] = latitudes.len();
    let placed = per_lat
        .into_shape_with_order(IxDyn(&placed_shape))
        .map_err(|_| shape_error())?;
    broadcast_to_grid(placed.view(), spatial_shape)
}

/// Computes the weight multipliers for the valid points of `index`.
pub fn compute_weights(scheme: &WeightScheme, index: &SpatialIndex) -> Result<WeightVector> {
    let spatial_shape = index.shape();
    let grid = match scheme {
        WeightScheme::None | WeightScheme::Equal => return Ok(WeightVector::ones(index.n_valid())),
        WeightScheme::Latitude { latitudes, axis } => latitude_grid(latitudes, *axis, spatial_shape)?,
        WeightScheme::Area { areas } => {
            validate_non_negative(areas.iter())?;
            let max_area = areas.iter().cloned().fold(0.0_f64, f64::max);
            if max_area <= 0.0 {
                return Err(EofError::InvalidWeight("all cell areas are zero".to_string()));
            }
            broadcast_to_grid(areas.view(), spatial_shape)?.mapv(|a| (a / max_area).sqrt())
        }
        WeightScheme::Custom(values) => {
            validate_non_negative(values.iter())?;
            broadcast_to_grid(values.view(), spatial_shape)?
        }
    };

    // Logical iteration order of the grid is row-major, matching SpatialIndex.
    let flat: Vec<f64> = grid.iter().cloned().collect();
    let values: Array1<f64> = index.positions().iter().map(|&pos| flat[pos]).collect();
    debug!("Computed {} weight multipliers for scheme {}.", values.len(), scheme_name(scheme));
    WeightVector::new(values)
}

fn scheme_name(scheme: &WeightScheme) -> &'static str {
    match scheme {
        WeightScheme::None => "none",
        WeightScheme::Equal => "equal",
        WeightScheme::Latitude { .. } => "latitude",
        WeightScheme::Area { .. } => "area",
        WeightScheme::Custom(_) => "custom",
    }
}

/// Multiplies column `j` of `matrix` by multiplier `j`.
pub fn apply_weights(matrix: &mut Array2<f64>, weights: &WeightVector) -> Result<()> {
    if matrix.ncols() != weights.len() {
        return Err(EofError::WeightShape {
            weights: vec![weights.len()],
            spatial: vec![matrix.ncols()],
        });
    }
    *matrix *= weights.values();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissingPolicy;
    use crate::flatten::flatten;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    fn grid_index(nlat: usize, nlon: usize) -> SpatialIndex {
        let field = Array3::<f64>::from_shape_fn((3, nlat, nlon), |(t, i, j)| (t + i + j) as f64);
        flatten(field.view().into_dyn(), None, MissingPolicy::Strict)
            .unwrap()
            .index()
            .clone()
    }

    #[test]
    fn test_latitude_weights_match_sqrt_cos_and_vanish_at_poles() {
        let lats = array![-90.0, -60.0, -30.0, 0.0, 30.0, 60.0, 90.0];
        let w = latitude_weights(lats.view()).unwrap();
        for (&lat, &wi) in lats.iter().zip(w.iter()) {
            let expected = lat.to_radians().cos().max(0.0).sqrt();
            assert!((wi - expected).abs() < 5e-4, "lat {}: {} vs {}", lat, wi, expected);
        }
        assert_eq!(w[0], 0.0);
        assert_eq!(w[6], 0.0);
        assert_abs_diff_eq!(w[3], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[2], 0.930_604_859, epsilon = 1e-3);
    }

    #[test]
    fn test_latitude_scheme_broadcasts_across_longitude() {
        let index = grid_index(3, 4);
        let scheme = WeightScheme::Latitude { latitudes: array![-45.0, 0.0, 45.0], axis: 0 };
        let w = compute_weights(&scheme, &index).unwrap();
        assert_eq!(w.len(), 12);
        let expected_edge = (45.0_f64).to_radians().cos().sqrt();
        for j in 0..4 {
            assert_abs_diff_eq!(w.values()[j], expected_edge, epsilon = 1e-12);
            assert_abs_diff_eq!(w.values()[4 + j], 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(w.values()[8 + j], expected_edge, epsilon = 1e-12);
        }
        assert!(!w.is_uniform());
    }

    #[test]
    fn test_latitude_scheme_rejects_wrong_length() {
        let index = grid_index(3, 4);
        let scheme = WeightScheme::Latitude { latitudes: array![0.0, 10.0], axis: 0 };
        assert!(matches!(compute_weights(&scheme, &index), Err(EofError::WeightShape { .. })));
    }

    #[test]
    fn test_custom_weights_broadcast_trailing_and_reject_bad_shapes() {
        let index = grid_index(2, 3);
        let per_lon = WeightScheme::Custom(array![1.0, 2.0, 3.0].into_dyn());
        let w = compute_weights(&per_lon, &index).unwrap();
        assert_eq!(w.values(), &array![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);

        let per_lat = WeightScheme::Custom(array![[1.0], [2.0]].into_dyn());
        let w = compute_weights(&per_lat, &index).unwrap();
        assert_eq!(w.values(), &array![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

        let bad = WeightScheme::Custom(array![1.0, 2.0].into_dyn());
        assert!(matches!(compute_weights(&bad, &index), Err(EofError::WeightShape { .. })));
    }

    #[test]
    fn test_negative_and_nan_weights_rejected() {
        let index = grid_index(2, 2);
        let negative = WeightScheme::Custom(array![[1.0, -1.0], [1.0, 1.0]].into_dyn());
        assert!(matches!(compute_weights(&negative, &index), Err(EofError::InvalidWeight(_))));
        let nan = WeightScheme::Area { areas: array![[1.0, f64::NAN], [1.0, 1.0]].into_dyn() };
        assert!(matches!(compute_weights(&nan, &index), Err(EofError::InvalidWeight(_))));
    }

    #[test]
    fn test_area_weights_from_cell_bounds() {
        let lat_bounds = array![[-90.0, 0.0], [0.0, 90.0]];
        let lon_bounds = array![[0.0, 180.0], [180.0, 360.0]];
        let areas = cell_areas(lat_bounds.view(), lon_bounds.view()).unwrap();
        let total: f64 = areas.sum();
        assert_abs_diff_eq!(total, 4.0 * std::f64::consts::PI, epsilon = 1e-12);

        let index = grid_index(2, 2);
        let w = compute_weights(&WeightScheme::Area { areas: areas.into_dyn() }, &index).unwrap();
        assert!(w.is_uniform());
        assert_abs_diff_eq!(w.values()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_weight_is_legal_and_unweights_to_nan() {
        let w = WeightVector::new(array![0.0, 2.0]).unwrap();
        let mut m = array![[1.0, 4.0], [2.0, 6.0]];
        w.unweight_columns(m.view_mut());
        assert!(m[[0, 0]].is_nan());
        assert_eq!(m[[1, 1]], 3.0);
    }
}
