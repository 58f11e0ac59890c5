// src/multivariate.rs
//
// Concatenates flattened, weighted fields along the spatial axis and keeps
// the bookkeeping needed to split spatial-axis results back per field.

use crate::config::MissingPolicy;
use crate::error::{EofError, Result};
use crate::flatten::{flatten, SpatialIndex};
use crate::weights::{apply_weights, compute_weights, WeightScheme, WeightVector};
use log::{debug, info, warn};
use ndarray::{concatenate, s, Array1, Array2, ArrayD, ArrayView2, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

/// One input field together with its missing mask and weighting scheme.
#[derive(Debug, Clone)]
pub struct FieldSpec<'a> {
    /// `(T, *spatial_dims)`, NaN marks missing values.
    pub data: ArrayViewD<'a, f64>,
    /// Same shape as `data`; `true` marks missing values.
    pub mask: Option<ArrayViewD<'a, bool>>,
    pub weights: WeightScheme,
}

impl<'a> FieldSpec<'a> {
    pub fn new(data: ArrayViewD<'a, f64>) -> Self {
        Self { data, mask: None, weights: WeightScheme::None }
    }

    pub fn with_mask(mut self, mask: ArrayViewD<'a, bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_weights(mut self, weights: WeightScheme) -> Self {
        self.weights = weights;
        self
    }
}

/// Column range `[start, end)` of one field inside the combined matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub field_id: usize,
    pub start: usize,
    pub end: usize,
    pub index: SpatialIndex,
    pub weights: WeightVector,
}

impl Channel {
    pub fn width(&self) -> usize {
        self.end - self.start
    }
}

/// Per-field column ranges of a combined matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl ChannelTable {
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Total number of columns over all channels.
    pub fn total_width(&self) -> usize {
        self.channels.last().map_or(0, |c| c.end)
    }

    /// Weight multipliers of every channel, concatenated in column order.
    pub fn combined_weights(&self) -> Array1<f64> {
        self.channels
            .iter()
            .flat_map(|c| c.weights.values().iter().cloned())
            .collect()
    }

    /// Divides every column of an `(R, S_total)` matrix by its multiplier;
    /// zero-weight columns become NaN.
    pub fn unweight_columns(&self, matrix: &mut Array2<f64>) {
        for c in &self.channels {
            c.weights.unweight_columns(matrix.slice_mut(s![.., c.start..c.end]));
        }
    }

    /// True when all channels carry the same uniform multiplier.
    pub fn is_uniformly_weighted(&self) -> bool {
        WeightVector::new(self.combined_weights()).map_or(false, |w| w.is_uniform())
    }

    /// Splits an `(R, S_total)` matrix into one `(R, S_field)` block per field.
    pub fn split_columns(&self, matrix: ArrayView2<f64>) -> Result<Vec<Array2<f64>>> {
        if matrix.ncols() != self.total_width() {
            return Err(EofError::ShapeMismatch(format!(
                "matrix has {} columns but the channel table spans {}",
                matrix.ncols(),
                self.total_width()
            )));
        }
        Ok(self
            .channels
            .iter()
            .map(|c| matrix.slice(s![.., c.start..c.end]).to_owned())
            .collect())
    }

    /// Splits per field and scatters each block back to `(R, *field_shape)`.
    pub fn split_unflatten(&self, matrix: ArrayView2<f64>) -> Result<Vec<ArrayD<f64>>> {
        self.split_columns(matrix)?
            .iter()
            .zip(self.channels.iter())
            .map(|(block, c)| c.index.unflatten(block.view()))
            .collect()
    }

    /// Gathers the valid points of one new field per channel and concatenates
    /// them, unweighted.
    pub(crate) fn gather_fields(&self, fields: &[FieldSpec<'_>]) -> Result<Array2<f64>> {
        if fields.len() != self.channels.len() {
            return Err(EofError::ShapeMismatch(format!(
                "expected {} fields, got {}",
                self.channels.len(),
                fields.len()
            )));
        }
        let mut blocks = Vec::with_capacity(fields.len());
        for (field, channel) in fields.iter().zip(self.channels.iter()) {
            blocks.push(channel.index.gather(field.data.view(), field.mask.as_ref().map(|m| m.view()))?);
        }
        let n_rows = blocks.first().map_or(0, |b| b.nrows());
        if let Some((i, b)) = blocks.iter().enumerate().find(|(_, b)| b.nrows() != n_rows) {
            return Err(EofError::TimeMismatch { field_id: i, expected: n_rows, found: b.nrows() });
        }
        let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| EofError::ShapeMismatch(format!("concatenate failed: {}", e)))
    }
}

/// Weighted fields concatenated along the spatial axis.
#[derive(Debug, Clone)]
pub struct CombinedMatrix {
    unweighted: Array2<f64>,
    weighted: Array2<f64>,
    channels: ChannelTable,
}

impl CombinedMatrix {
    /// `(T, S_total)` matrix with weights applied.
    pub fn weighted(&self) -> &Array2<f64> {
        &self.weighted
    }

    /// `(T, S_total)` matrix in physical units.
    pub fn unweighted(&self) -> &Array2<f64> {
        &self.unweighted
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn n_times(&self) -> usize {
        self.weighted.nrows()
    }

    pub fn into_parts(self) -> (Array2<f64>, Array2<f64>, ChannelTable) {
        (self.unweighted, self.weighted, self.channels)
    }
}

/// Flattens and weights each field, then concatenates them in input order.
///
/// All fields must share the same number of time samples.
pub fn combine(fields: &[FieldSpec<'_>], policy: MissingPolicy) -> Result<CombinedMatrix> {
    if fields.is_empty() {
        return Err(EofError::InvalidInputShape("at least one field is required".to_string()));
    }
    let n_times = fields[0].data.shape().first().copied().unwrap_or(0);
    for (field_id, field) in fields.iter().enumerate().skip(1) {
        let found = field.data.shape().first().copied().unwrap_or(0);
        if found != n_times {
            return Err(EofError::TimeMismatch { field_id, expected: n_times, found });
        }
    }

    let mut channels = Vec::with_capacity(fields.len());
    let mut unweighted_blocks = Vec::with_capacity(fields.len());
    let mut weighted_blocks = Vec::with_capacity(fields.len());
    let mut start = 0;
    for (field_id, field) in fields.iter().enumerate() {
        let flat = flatten(field.data.view(), field.mask.as_ref().map(|m| m.view()), policy)?;
        let (data, index) = flat.into_parts();
        if data.ncols() == 0 {
            warn!("Field {} has no valid spatial points; it contributes no columns.", field_id);
        }
        let weights = compute_weights(&field.weights, &index)?;
        let mut weighted = data.clone();
        apply_weights(&mut weighted, &weights)?;

        let end = start + data.ncols();
        channels.push(Channel { field_id, start, end, index, weights });
        unweighted_blocks.push(data);
        weighted_blocks.push(weighted);
        start = end;
    }

    let join = |blocks: &[Array2<f64>]| -> Result<Array2<f64>> {
        let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| EofError::InvalidInputShape(format!("concatenate failed: {}", e)))
    };
    let unweighted = join(&unweighted_blocks)?;
    let weighted = join(&weighted_blocks)?;

    if fields.len() > 1 {
        info!("Combined {} fields into a {} x {} matrix.", fields.len(), n_times, start);
    } else {
        debug!("Single field matrix is {} x {}.", n_times, start);
    }
    Ok(CombinedMatrix {
        unweighted,
        weighted,
        channels: ChannelTable { channels },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_time_mismatch_is_rejected() {
        let a = Array2::<f64>::zeros((5, 3)).into_dyn();
        let b = Array2::<f64>::zeros((4, 3)).into_dyn();
        let fields = [FieldSpec::new(a.view()), FieldSpec::new(b.view())];
        match combine(&fields, MissingPolicy::Strict) {
            Err(EofError::TimeMismatch { field_id, expected, found }) => {
                assert_eq!((field_id, expected, found), (1, 5, 4));
            }
            other => panic!("expected TimeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_table_records_ranges_and_splits() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn();
        let b = array![[7.0, f64::NAN, 8.0], [9.0, f64::NAN, 10.0], [11.0, f64::NAN, 12.0]].into_dyn();
        let fields = [
            FieldSpec::new(a.view()),
            FieldSpec::new(b.view()).with_weights(WeightScheme::Custom(array![2.0, 2.0, 2.0].into_dyn())),
        ];
        let combined = combine(&fields, MissingPolicy::Strict).unwrap();
        let table = combined.channels();
        assert_eq!(table.len(), 2);
        assert_eq!((table.channels()[0].start, table.channels()[0].end), (0, 2));
        assert_eq!((table.channels()[1].start, table.channels()[1].end), (2, 4));
        assert_eq!(combined.weighted().row(0).to_vec(), vec![1.0, 2.0, 14.0, 16.0]);
        assert_eq!(combined.unweighted().row(0).to_vec(), vec![1.0, 2.0, 7.0, 8.0]);
        assert!(!table.is_uniformly_weighted());

        let pieces = table.split_unflatten(combined.unweighted().view()).unwrap();
        assert_eq!(pieces[0].shape(), &[3, 2]);
        assert_eq!(pieces[1].shape(), &[3, 3]);
        assert!(pieces[1][[0, 1]].is_nan());
        assert_eq!(pieces[1][[2, 2]], 12.0);

        assert!(matches!(
            table.split_columns(Array2::<f64>::zeros((1, 3)).view()),
            Err(EofError::ShapeMismatch(_))
        ));
    }
}
