//! Combining per-chunk partial statistics into one running accumulator.
//!
//! [`PartialStatistics`] are small value-semantic records; combining two of
//! them touches only their numeric aggregate fields, never any buffered
//! sample data, so a combined accumulator can't be invalidated by a chunk
//! being dropped. [`GlobalStatistics::fold`] is the only mutation path and
//! it enforces in-order, exactly-once folding up front.

use std::ops::Range;

use ndarray::{Array2, Array3, Axis};
use thiserror::Error;

/// Running statistics for one (frequency, polarisation) cell, combinable
/// across disjoint time ranges by plain field-wise addition.
#[derive(Debug, Clone, Copy)]
pub struct CellStats {
    /// Number of finite metric rows that contributed.
    pub count: u64,
    pub sum: f64,
    pub sumsq: f64,
    pub min: f64,
    pub max: f64,
    /// Number of metric rows with no unflagged baseline (the metric is NaN
    /// there).
    pub flagged: u64,
}

impl Default for CellStats {
    fn default() -> CellStats {
        CellStats {
            count: 0,
            sum: 0.0,
            sumsq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            flagged: 0,
        }
    }
}

impl CellStats {
    /// Account for one metric row's value. NaN means the row had no
    /// unflagged baseline.
    pub fn update(&mut self, value: f64) {
        if value.is_nan() {
            self.flagged += 1;
        } else {
            self.count += 1;
            self.sum += value;
            self.sumsq += value * value;
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    /// Combine with the statistics of a disjoint time range.
    pub fn merge(&mut self, other: &CellStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sumsq += other.sumsq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.flagged += other.flagged;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            let mean = self.mean();
            // Guard the subtraction against float round-off going negative.
            (self.sumsq / self.count as f64 - mean * mean).max(0.0).sqrt()
        }
    }
}

/// The reduction of one chunk's own samples. Immutable after construction;
/// handed to [`GlobalStatistics::fold`] exactly once.
#[derive(Debug)]
pub struct PartialStatistics {
    /// Which chunk produced this record.
    pub chunk_index: usize,

    /// The source timestep indices of the metric rows owned by this chunk.
    /// With time-differencing, a row is attributed to the later of the two
    /// timesteps it spans, so ranges from consecutive chunks abut exactly.
    pub own_timesteps: Range<usize>,

    /// Metric rows, shape `(own timesteps, freq, pol)`. NaN where every
    /// baseline was flagged.
    pub metric_tfp: Array3<f64>,

    /// Per-cell aggregates over this chunk's rows, shape `(freq, pol)`.
    pub cells: Array2<CellStats>,

    /// Baseline-samples that went into the metric rows, after flagging.
    pub num_samples: u64,
}

impl PartialStatistics {
    pub fn num_own_timesteps(&self) -> usize {
        self.own_timesteps.len()
    }
}

/// The single accumulator covering all chunks folded so far. One writer for
/// the lifetime of a run.
pub struct GlobalStatistics {
    num_freqs: usize,
    num_pols: usize,

    /// The chunk index the next fold must carry.
    next_chunk_index: usize,

    /// The timestep the next fold's own range must start at.
    next_timestep: usize,

    /// All metric rows folded so far, shape `(time, freq, pol)`, in time
    /// order.
    metric_tfp: Array3<f64>,

    /// Source timestep index of each metric row.
    row_timesteps: Vec<usize>,

    cells: Array2<CellStats>,

    num_samples: u64,
}

impl GlobalStatistics {
    /// An empty accumulator. `first_timestep` is the timestep the first
    /// folded row must carry (the differencing window for a differenced run,
    /// 0 otherwise).
    pub fn new(num_freqs: usize, num_pols: usize, first_timestep: usize) -> GlobalStatistics {
        GlobalStatistics {
            num_freqs,
            num_pols,
            next_chunk_index: 0,
            next_timestep: first_timestep,
            metric_tfp: Array3::zeros((0, num_freqs, num_pols)),
            row_timesteps: vec![],
            cells: Array2::default((num_freqs, num_pols)),
            num_samples: 0,
        }
    }

    /// Combine a chunk's partial statistics into the running state.
    ///
    /// Folds must arrive in chunk order, each exactly once. All checks run
    /// before any mutation, so a rejected fold leaves the accumulator
    /// untouched.
    pub fn fold(&mut self, partial: &PartialStatistics) -> Result<(), FoldError> {
        if partial.chunk_index < self.next_chunk_index {
            return Err(FoldError::Duplicate {
                chunk_index: partial.chunk_index,
            });
        }
        if partial.chunk_index > self.next_chunk_index {
            return Err(FoldError::OutOfOrder {
                chunk_index: partial.chunk_index,
                expected: self.next_chunk_index,
            });
        }
        // A chunk shorter than the differencing window owns no rows; there's
        // no contiguity to check for it.
        if !partial.own_timesteps.is_empty() && partial.own_timesteps.start != self.next_timestep {
            return Err(FoldError::TimestepGap {
                chunk_index: partial.chunk_index,
                got: partial.own_timesteps.start,
                expected: self.next_timestep,
            });
        }
        let (num_rows, num_freqs, num_pols) = partial.metric_tfp.dim();
        if num_rows != partial.own_timesteps.len()
            || num_freqs != self.num_freqs
            || num_pols != self.num_pols
            || partial.cells.dim() != (self.num_freqs, self.num_pols)
        {
            return Err(FoldError::ShapeMismatch {
                chunk_index: partial.chunk_index,
            });
        }

        self.metric_tfp
            .append(Axis(0), partial.metric_tfp.view())
            .map_err(|_| FoldError::ShapeMismatch {
                chunk_index: partial.chunk_index,
            })?;
        self.row_timesteps.extend(partial.own_timesteps.clone());
        for (cell, partial_cell) in self.cells.iter_mut().zip(partial.cells.iter()) {
            cell.merge(partial_cell);
        }
        self.num_samples += partial.num_samples;
        self.next_chunk_index += 1;
        if !partial.own_timesteps.is_empty() {
            self.next_timestep = partial.own_timesteps.end;
        }
        Ok(())
    }

    pub fn num_folded_chunks(&self) -> usize {
        self.next_chunk_index
    }

    pub fn num_rows(&self) -> usize {
        self.row_timesteps.len()
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn metric_tfp(&self) -> &Array3<f64> {
        &self.metric_tfp
    }

    pub fn row_timesteps(&self) -> &[usize] {
        &self.row_timesteps
    }

    pub fn cells(&self) -> &Array2<CellStats> {
        &self.cells
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldError {
    #[error("Chunk {chunk_index} has already been folded")]
    Duplicate { chunk_index: usize },

    #[error("Chunk {chunk_index} was folded out of order (expected chunk {expected})")]
    OutOfOrder { chunk_index: usize, expected: usize },

    #[error("Chunk {chunk_index}'s rows start at timestep {got}, but the accumulator expects {expected}")]
    TimestepGap {
        chunk_index: usize,
        got: usize,
        expected: usize,
    },

    #[error("Chunk {chunk_index}'s partial statistics have the wrong shape")]
    ShapeMismatch { chunk_index: usize },
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    use super::*;

    fn partial(chunk_index: usize, own_timesteps: Range<usize>, value: f64) -> PartialStatistics {
        let num_rows = own_timesteps.len();
        let metric_tfp = Array3::from_elem((num_rows, 2, 2), value);
        let mut cells = Array2::<CellStats>::default((2, 2));
        for cell in cells.iter_mut() {
            for _ in 0..num_rows {
                cell.update(value);
            }
        }
        PartialStatistics {
            chunk_index,
            own_timesteps,
            metric_tfp,
            cells,
            num_samples: (num_rows * 2 * 2) as u64,
        }
    }

    #[test]
    fn cell_stats_merge_matches_single_pass() {
        let values = [1.0, 2.5, 3.0, f64::NAN, 4.5, 0.5];
        let mut whole = CellStats::default();
        for v in values {
            whole.update(v);
        }

        let mut left = CellStats::default();
        let mut right = CellStats::default();
        for v in &values[..3] {
            left.update(*v);
        }
        for v in &values[3..] {
            right.update(*v);
        }
        left.merge(&right);

        assert_eq!(left.count, whole.count);
        assert_eq!(left.flagged, whole.flagged);
        assert_abs_diff_eq!(left.mean(), whole.mean(), epsilon = 1e-12);
        assert_abs_diff_eq!(left.std(), whole.std(), epsilon = 1e-12);
        assert_abs_diff_eq!(left.min, whole.min);
        assert_abs_diff_eq!(left.max, whole.max);
    }

    #[test]
    fn folds_in_order_accumulate() {
        let mut global = GlobalStatistics::new(2, 2, 1);
        global.fold(&partial(0, 1..4, 2.0)).unwrap();
        global.fold(&partial(1, 4..6, 3.0)).unwrap();

        assert_eq!(global.num_folded_chunks(), 2);
        assert_eq!(global.num_rows(), 5);
        assert_eq!(global.row_timesteps(), [1, 2, 3, 4, 5]);
        let cell = global.cells()[(0, 0)];
        assert_eq!(cell.count, 5);
        assert_abs_diff_eq!(cell.mean(), (3.0 * 2.0 + 2.0 * 3.0) / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn duplicate_fold_is_rejected_without_mutation() {
        let mut global = GlobalStatistics::new(2, 2, 1);
        let p0 = partial(0, 1..4, 2.0);
        global.fold(&p0).unwrap();
        let rows_before = global.num_rows();
        let sum_before = global.cells()[(0, 0)].sum;

        let result = global.fold(&p0);
        assert_eq!(result, Err(FoldError::Duplicate { chunk_index: 0 }));
        assert_eq!(global.num_rows(), rows_before);
        assert_abs_diff_eq!(global.cells()[(0, 0)].sum, sum_before);
    }

    #[test]
    fn out_of_order_fold_is_rejected() {
        let mut global = GlobalStatistics::new(2, 2, 1);
        global.fold(&partial(0, 1..4, 2.0)).unwrap();
        let result = global.fold(&partial(2, 6..8, 1.0));
        assert_eq!(
            result,
            Err(FoldError::OutOfOrder {
                chunk_index: 2,
                expected: 1
            })
        );
        assert_eq!(global.num_rows(), 3);
    }

    #[test]
    fn timestep_gap_is_rejected() {
        let mut global = GlobalStatistics::new(2, 2, 1);
        global.fold(&partial(0, 1..4, 2.0)).unwrap();
        let result = global.fold(&partial(1, 5..7, 1.0));
        assert_eq!(
            result,
            Err(FoldError::TimestepGap {
                chunk_index: 1,
                got: 5,
                expected: 4
            })
        );
    }
}
