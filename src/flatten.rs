// src/flatten.rs
//
// Reshapes time-leading fields into (time × space) matrices of valid points
// and scatters spatial-axis results back onto the original grid.

use crate::config::MissingPolicy;
use crate::error::{EofError, Result};
use log::{debug, trace};
use ndarray::{Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Original spatial shape plus which grid points survived masking.
///
/// Flat positions are in row-major (C) order of the spatial dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialIndex {
    shape: Vec<usize>,
    valid: Vec<bool>,
    positions: Vec<usize>,
}

impl SpatialIndex {
    /// Builds an index from a spatial shape and a row-major validity mask.
    pub fn new(shape: Vec<usize>, valid: Vec<bool>) -> Result<Self> {
        let n_points: usize = shape.iter().product();
        if valid.len() != n_points {
            return Err(EofError::ShapeMismatch(format!(
                "validity mask has {} entries but spatial shape {:?} has {} points",
                valid.len(),
                shape,
                n_points
            )));
        }
        let positions = valid
            .iter()
            .enumerate()
            .filter_map(|(i, &ok)| if ok { Some(i) } else { None })
            .collect();
        Ok(Self { shape, valid, positions })
    }

    /// Spatial shape, without the time axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn mask(&self) -> &[bool] {
        &self.valid
    }

    /// Flat positions of the valid points, in column order of the flattened matrix.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Total number of grid points, valid or not.
    pub fn n_points(&self) -> usize {
        self.valid.len()
    }

    /// Number of valid points `S`.
    pub fn n_valid(&self) -> usize {
        self.positions.len()
    }

    /// Scatters an `(R, S)` matrix back to `(R, *shape)`, with NaN at excluded points.
    pub fn unflatten(&self, matrix: ArrayView2<f64>) -> Result<ArrayD<f64>> {
        if matrix.ncols() != self.n_valid() {
            return Err(EofError::ShapeMismatch(format!(
                "cannot unflatten {} columns onto a grid with {} valid points",
                matrix.ncols(),
                self.n_valid()
            )));
        }
        let n_rows = matrix.nrows();
        let mut grid = Array2::from_elem((n_rows, self.n_points()), f64::NAN);
        for (col, &pos) in self.positions.iter().enumerate() {
            grid.column_mut(pos).assign(&matrix.column(col));
        }
        let mut full_shape = Vec::with_capacity(self.shape.len() + 1);
        full_shape.push(n_rows);
        full_shape.extend_from_slice(&self.shape);
        grid.into_shape_with_order(IxDyn(&full_shape))
            .map_err(|e| EofError::ShapeMismatch(format!("unflatten reshape failed: {}", e)))
    }

    /// Scatters a single `(S,)` vector back to the spatial shape.
    pub fn unflatten_row(&self, row: ArrayView1<f64>) -> Result<ArrayD<f64>> {
        let as_matrix = row.insert_axis(Axis(0));
        let grid = self.unflatten(as_matrix)?;
        Ok(grid.index_axis_move(Axis(0), 0))
    }

    /// Gathers the valid points of a new field laid out on this grid.
    ///
    /// `field` is either `(R, *shape)` or a single slice of shape `shape`.
    /// Every point valid here must be present in `field`; points excluded
    /// here are ignored whatever their value.
    pub fn gather(&self, field: ArrayViewD<f64>, mask: Option<ArrayViewD<bool>>) -> Result<Array2<f64>> {
        let spatial_rank = self.shape.len();
        let field = if field.ndim() == spatial_rank {
            field.insert_axis(Axis(0))
        } else {
            field
        };
        if field.ndim() != spatial_rank + 1 || field.shape()[1..] != self.shape[..] {
            return Err(EofError::ShapeMismatch(format!(
                "field spatial shape {:?} does not match the analysed shape {:?}",
                &field.shape()[field.ndim().min(1)..],
                self.shape
            )));
        }
        if let Some(m) = mask.as_ref() {
            let expected_mask_rank = m.ndim() == field.ndim() || m.ndim() == spatial_rank;
            if !expected_mask_rank || m.len() != field.len() {
                return Err(EofError::ShapeMismatch(format!(
                    "mask shape {:?} does not match field shape {:?}",
                    m.shape(),
                    field.shape()
                )));
            }
        }
        let n_rows = field.shape()[0];
        let table = to_time_by_space(&field, n_rows, self.n_points())?;
        let mask_table = match mask.as_ref() {
            Some(m) => Some(
                m.to_shape((n_rows, self.n_points()))
                    .map_err(|e| EofError::ShapeMismatch(format!("mask reshape failed: {}", e)))?,
            ),
            None => None,
        };

        let mut out = Array2::zeros((n_rows, self.n_valid()));
        for (col, &pos) in self.positions.iter().enumerate() {
            for row in 0..n_rows {
                let value = table[[row, pos]];
                let masked = mask_table.as_ref().map_or(false, |m| m[[row, pos]]);
                if masked || value.is_nan() {
                    return Err(EofError::ShapeMismatch(format!(
                        "field is missing a value at flat spatial position {} (row {}), \
                         which was valid in the analysed field",
                        pos, row
                    )));
                }
                out[[row, col]] = value;
            }
        }
        Ok(out)
    }
}

/// A `(T, S)` matrix of valid points and the index that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedField {
    data: Array2<f64>,
    index: SpatialIndex,
}

impl FlattenedField {
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn n_times(&self) -> usize {
        self.data.nrows()
    }

    pub fn into_parts(self) -> (Array2<f64>, SpatialIndex) {
        (self.data, self.index)
    }

    /// Mirror of [`flatten`]: scatters this field's data back to `(T, *shape)`.
    pub fn unflatten(&self) -> Result<ArrayD<f64>> {
        self.index.unflatten(self.data.view())
    }
}

fn to_time_by_space(field: &ArrayViewD<f64>, n_times: usize, n_points: usize) -> Result<Array2<f64>> {
    field
        .to_shape((n_times, n_points))
        .map(|cow| cow.into_owned())
        .map_err(|e| EofError::InvalidInputShape(format!("cannot reshape field to (time, space): {}", e)))
}

/// Flattens a `(T, *spatial_dims)` field into a `(T, S)` matrix of valid points.
///
/// A value is missing if it is NaN or flagged `true` in `mask`. Points
/// missing at every time step are always excluded; points missing at only
/// some time steps fail under [`MissingPolicy::Strict`] and are excluded
/// under [`MissingPolicy::Lenient`].
pub fn flatten(field: ArrayViewD<f64>, mask: Option<ArrayViewD<bool>>, policy: MissingPolicy) -> Result<FlattenedField> {
    if field.ndim() < 2 {
        return Err(EofError::InvalidInputShape(format!(
            "field must have a time axis and at least one spatial axis, got {} dimension(s)",
            field.ndim()
        )));
    }
    let n_times = field.shape()[0];
    if n_times < 2 {
        return Err(EofError::InvalidInputShape(format!(
            "field must have at least 2 time samples, got {}",
            n_times
        )));
    }
    if let Some(m) = mask.as_ref() {
        if m.shape() != field.shape() {
            return Err(EofError::ShapeMismatch(format!(
                "mask shape {:?} does not match field shape {:?}",
                m.shape(),
                field.shape()
            )));
        }
    }
    if field.iter().any(|v| v.is_infinite()) {
        return Err(EofError::InvalidInputShape("field contains infinite values".to_string()));
    }

    let spatial_shape = field.shape()[1..].to_vec();
    let n_points: usize = spatial_shape.iter().product();
    let table = to_time_by_space(&field, n_times, n_points)?;
    let mask_table = match mask.as_ref() {
        Some(m) => Some(
            m.to_shape((n_times, n_points))
                .map_err(|e| EofError::ShapeMismatch(format!("mask reshape failed: {}", e)))?,
        ),
        None => None,
    };

    let mut valid = Vec::with_capacity(n_points);
    for pos in 0..n_points {
        let missing_steps = (0..n_times)
            .filter(|&t| table[[t, pos]].is_nan() || mask_table.as_ref().map_or(false, |m| m[[t, pos]]))
            .count();
        match missing_steps {
            0 => valid.push(true),
            n if n == n_times => valid.push(false),
            n => match policy {
                MissingPolicy::Strict => {
                    return Err(EofError::InconsistentMissingness {
                        position: pos,
                        missing_steps: n,
                        time_steps: n_times,
                    });
                }
                MissingPolicy::Lenient => {
                    trace!("Excluding spatial point {} missing in {}/{} time steps.", pos, n, n_times);
                    valid.push(false);
                }
            },
        }
    }

    let index = SpatialIndex::new(spatial_shape, valid)?;
    let data = table.select(Axis(1), index.positions());
    debug!(
        "Flattened field to {} x {} ({} of {} spatial points excluded).",
        data.nrows(),
        data.ncols(),
        n_points - index.n_valid(),
        n_points
    );
    Ok(FlattenedField { data, index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_fully_missing_column_is_dropped_and_restored_as_nan() {
        let mut field = Array3::<f64>::from_shape_fn((4, 2, 3), |(t, i, j)| (t * 6 + i * 3 + j) as f64);
        for t in 0..4 {
            field[[t, 1, 2]] = f64::NAN;
        }
        let flat = flatten(field.view().into_dyn(), None, MissingPolicy::Strict).unwrap();
        assert_eq!(flat.data().dim(), (4, 5));
        assert_eq!(flat.index().positions(), &[0, 1, 2, 3, 4]);

        let restored = flat.unflatten().unwrap();
        assert_eq!(restored.shape(), &[4, 2, 3]);
        for t in 0..4 {
            assert!(restored[[t, 1, 2]].is_nan());
            assert_eq!(restored[[t, 0, 1]], field[[t, 0, 1]]);
        }
    }

    #[test]
    fn test_partial_missingness_strict_vs_lenient() {
        let field = array![[1.0, 2.0, 3.0], [4.0, f64::NAN, 6.0], [7.0, 8.0, 9.0]].into_dyn();
        match flatten(field.view(), None, MissingPolicy::Strict) {
            Err(EofError::InconsistentMissingness { position, missing_steps, time_steps }) => {
                assert_eq!((position, missing_steps, time_steps), (1, 1, 3));
            }
            other => panic!("expected InconsistentMissingness, got {:?}", other),
        }
        let lenient = flatten(field.view(), None, MissingPolicy::Lenient).unwrap();
        assert_eq!(lenient.index().positions(), &[0, 2]);
        assert_eq!(lenient.data(), &array![[1.0, 3.0], [4.0, 6.0], [7.0, 9.0]]);
    }

    #[test]
    fn test_explicit_mask_marks_missing() {
        let field = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let mask = array![[false, true], [false, true]].into_dyn();
        let flat = flatten(field.view(), Some(mask.view()), MissingPolicy::Strict).unwrap();
        assert_eq!(flat.index().n_valid(), 1);
        assert_eq!(flat.data(), &array![[1.0], [3.0]]);
    }

    #[test]
    fn test_rejects_single_time_step_and_rank_one() {
        let one_step = array![[1.0, 2.0]].into_dyn();
        assert!(matches!(
            flatten(one_step.view(), None, MissingPolicy::Strict),
            Err(EofError::InvalidInputShape(_))
        ));
        let rank_one = array![1.0, 2.0, 3.0].into_dyn();
        assert!(matches!(
            flatten(rank_one.view(), None, MissingPolicy::Strict),
            Err(EofError::InvalidInputShape(_))
        ));
    }

    #[test]
    fn test_entirely_missing_field_has_zero_width() {
        let field = Array2::<f64>::from_elem((3, 4), f64::NAN).into_dyn();
        let flat = flatten(field.view(), None, MissingPolicy::Strict).unwrap();
        assert_eq!(flat.data().dim(), (3, 0));
    }

    #[test]
    fn test_gather_requires_values_at_valid_points() {
        let field = array![[1.0, f64::NAN, 3.0], [4.0, f64::NAN, 6.0]].into_dyn();
        let flat = flatten(field.view(), None, MissingPolicy::Strict).unwrap();

        let slice = array![10.0, f64::NAN, 30.0].into_dyn();
        let gathered = flat.index().gather(slice.view(), None).unwrap();
        assert_eq!(gathered, array![[10.0, 30.0]]);

        let holes = array![[10.0, 20.0, f64::NAN]].into_dyn();
        assert!(matches!(flat.index().gather(holes.view(), None), Err(EofError::ShapeMismatch(_))));

        let wrong = array![[1.0, 2.0]].into_dyn();
        assert!(matches!(flat.index().gather(wrong.view(), None), Err(EofError::ShapeMismatch(_))));
    }
}
