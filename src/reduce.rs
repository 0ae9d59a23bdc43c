//! Reducing one chunk of visibilities to partial statistics.
//!
//! The metric here is the incoherent noise spectrum: visibilities are
//! differenced in time (sky subtraction), the amplitude of each difference is
//! taken, and amplitudes are averaged over unflagged baselines, leaving one
//! value per (time, freq, pol). Differencing across a chunk boundary uses
//! the [`BoundaryCarry`] from the previous chunk, so no boundary row is
//! dropped or computed twice; a differenced row belongs to the chunk holding
//! the later of its two timesteps.

use std::ops::Range;

use marlu::c32;
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    aggregate::{CellStats, PartialStatistics},
    chunk::Chunk,
};

/// The last few time samples of a processed chunk, kept so the next chunk's
/// first differenced rows have their earlier sample. Replaced wholesale at
/// every chunk boundary, never merged.
pub struct BoundaryCarry {
    /// Source timestep indices of the carried rows.
    timesteps: Range<usize>,
    vis: Array4<c32>,
    flags: Array4<bool>,
}

/// Reduces chunks, in order, to [`PartialStatistics`]. Holds the only
/// cross-chunk state (the boundary carry); never retains a chunk's arrays.
pub struct ChunkReducer {
    /// Differencing window: rows are differenced against the row `window`
    /// timesteps earlier. 0 disables differencing (raw amplitudes).
    window: usize,
    carry: Option<BoundaryCarry>,
    /// Where the next chunk must start.
    processed_end: usize,
}

impl ChunkReducer {
    pub fn new(window: usize) -> ChunkReducer {
        ChunkReducer {
            window,
            carry: None,
            processed_end: 0,
        }
    }

    /// Reduce one chunk. Chunks must arrive contiguously and in order.
    pub fn reduce(&mut self, chunk: &Chunk) -> Result<PartialStatistics, ReduceError> {
        if chunk.timesteps.start != self.processed_end {
            return Err(ReduceError::Discontiguous {
                expected: self.processed_end,
                got: chunk.timesteps.start,
            });
        }
        if let Some(carry) = &self.carry {
            if carry.timesteps.end != chunk.timesteps.start {
                return Err(ReduceError::StaleCarry {
                    carry_end: carry.timesteps.end,
                    chunk_start: chunk.timesteps.start,
                });
            }
        }

        let window = self.window;
        let carry = self.carry.take();
        let (_, num_baselines, num_freqs, num_pols) = chunk.vis.dim();

        // Fetch the row for an absolute timestep, from the chunk or from the
        // carry.
        let row = |t: usize| -> (ArrayView3<c32>, ArrayView3<bool>) {
            if t >= chunk.timesteps.start {
                let i = t - chunk.timesteps.start;
                (chunk.vis.index_axis(Axis(0), i), chunk.flags.index_axis(Axis(0), i))
            } else {
                let carry = carry.as_ref().expect("own rows never reach before the carry");
                let i = t - carry.timesteps.start;
                (carry.vis.index_axis(Axis(0), i), carry.flags.index_axis(Axis(0), i))
            }
        };

        // The rows this chunk owns. The first chunk of a differenced run
        // owns nothing for its first `window` timesteps.
        let own_start = if window == 0 {
            chunk.timesteps.start
        } else if let Some(carry) = &carry {
            // The carry covers the `window` timesteps before this chunk (or
            // fewer near the start of a short source).
            chunk.timesteps.start.max(carry.timesteps.start + window)
        } else {
            chunk.timesteps.start + window
        };
        let own_timesteps = own_start.min(chunk.timesteps.end)..chunk.timesteps.end;

        let mut metric_tfp =
            Array3::<f64>::zeros((own_timesteps.len(), num_freqs, num_pols));
        let num_samples: u64 = metric_tfp
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(i_row, mut metric_fp)| {
                let t = own_timesteps.start + i_row;
                let (vis_later, flags_later) = row(t);
                let (vis_earlier, flags_earlier) = if window == 0 {
                    (None, None)
                } else {
                    let (v, f) = row(t - window);
                    (Some(v), Some(f))
                };

                let mut row_samples = 0_u64;
                for i_freq in 0..num_freqs {
                    for i_pol in 0..num_pols {
                        let mut sum = 0.0_f64;
                        let mut count = 0_u64;
                        for i_bl in 0..num_baselines {
                            let idx = (i_bl, i_freq, i_pol);
                            if flags_later[idx] {
                                continue;
                            }
                            let amp = match (&vis_earlier, &flags_earlier) {
                                (Some(vis_e), Some(flags_e)) => {
                                    if flags_e[idx] {
                                        continue;
                                    }
                                    (vis_later[idx] - vis_e[idx]).norm()
                                }
                                _ => vis_later[idx].norm(),
                            };
                            sum += f64::from(amp);
                            count += 1;
                        }
                        metric_fp[(i_freq, i_pol)] = if count == 0 {
                            f64::NAN
                        } else {
                            sum / count as f64
                        };
                        row_samples += count;
                    }
                }
                row_samples
            })
            .sum();

        let mut cells = Array2::<CellStats>::default((num_freqs, num_pols));
        for metric_fp in metric_tfp.axis_iter(Axis(0)) {
            for (cell, &value) in cells.iter_mut().zip(metric_fp.iter()) {
                cell.update(value);
            }
        }

        // Replace the carry with the last `window` rows of everything
        // processed so far (fewer if the source hasn't produced that many
        // yet).
        let new_carry = if window == 0 {
            None
        } else {
            let available_start = match &carry {
                Some(carry) => carry.timesteps.start,
                None => chunk.timesteps.start,
            };
            let carry_start = chunk
                .timesteps
                .end
                .saturating_sub(window)
                .max(available_start);
            let carry_timesteps = carry_start..chunk.timesteps.end;

            let shape = (carry_timesteps.len(), num_baselines, num_freqs, num_pols);
            let mut vis = Array4::zeros(shape);
            let mut flags = Array4::from_elem(shape, false);
            for (i, t) in carry_timesteps.clone().enumerate() {
                let (vis_row, flags_row) = row(t);
                vis.index_axis_mut(Axis(0), i).assign(&vis_row);
                flags.index_axis_mut(Axis(0), i).assign(&flags_row);
            }

            Some(BoundaryCarry {
                timesteps: carry_timesteps,
                vis,
                flags,
            })
        };
        self.carry = new_carry;
        self.processed_end = chunk.timesteps.end;

        Ok(PartialStatistics {
            chunk_index: chunk.index,
            own_timesteps,
            metric_tfp,
            cells,
            num_samples,
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceError {
    #[error("Chunks must be reduced in order: expected a chunk starting at timestep {expected}, got one starting at {got}")]
    Discontiguous { expected: usize, got: usize },

    #[error("Boundary carry ends at timestep {carry_end} but the chunk starts at {chunk_start}")]
    StaleCarry {
        carry_end: usize,
        chunk_start: usize,
    },
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use marlu::c32;
    use ndarray::Array4;

    use super::*;

    // One baseline, one freq, one pol: amplitudes follow `values`.
    fn chunk_1b1f1p(index: usize, timesteps: Range<usize>, values: &[f32]) -> Chunk {
        assert_eq!(values.len(), timesteps.len());
        let shape = (values.len(), 1, 1, 1);
        let vis = Array4::from_shape_fn(shape, |(t, _, _, _)| c32::new(values[t], 0.0));
        Chunk {
            index,
            timesteps,
            vis,
            flags: Array4::from_elem(shape, false),
        }
    }

    #[test]
    fn differencing_across_a_boundary_matches_a_whole_pass() {
        let values = [1.0, 4.0, 9.0, 16.0, 25.0, 36.0];

        let mut whole = ChunkReducer::new(1);
        let whole_partial = whole
            .reduce(&chunk_1b1f1p(0, 0..6, &values))
            .unwrap();

        let mut chunked = ChunkReducer::new(1);
        let p0 = chunked.reduce(&chunk_1b1f1p(0, 0..3, &values[..3])).unwrap();
        let p1 = chunked.reduce(&chunk_1b1f1p(1, 3..6, &values[3..])).unwrap();

        assert_eq!(whole_partial.own_timesteps, 1..6);
        assert_eq!(p0.own_timesteps, 1..3);
        assert_eq!(p1.own_timesteps, 3..6);

        // The boundary row (timestep 3) is |16 - 9| = 7, owned by chunk 1.
        assert_abs_diff_eq!(p1.metric_tfp[(0, 0, 0)], 7.0);
        for (i, t) in (1..6).enumerate() {
            let whole_value = whole_partial.metric_tfp[(i, 0, 0)];
            let chunked_value = if t < 3 {
                p0.metric_tfp[(t - 1, 0, 0)]
            } else {
                p1.metric_tfp[(t - 3, 0, 0)]
            };
            assert_abs_diff_eq!(chunked_value, whole_value);
        }
    }

    #[test]
    fn own_rows_sum_to_source_rows_minus_window() {
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        for chunk_size in 1..=10 {
            let mut reducer = ChunkReducer::new(1);
            let mut total_own = 0;
            let mut start = 0;
            let mut index = 0;
            while start < 10 {
                let end = (start + chunk_size).min(10);
                let partial = reducer
                    .reduce(&chunk_1b1f1p(index, start..end, &values[start..end]))
                    .unwrap();
                total_own += partial.num_own_timesteps();
                start = end;
                index += 1;
            }
            assert_eq!(total_own, 9, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn chunk_shorter_than_window_still_carries_correctly() {
        // Window 2, chunks of 1: every carry is rebuilt from carry + chunk.
        let values = [1.0, 2.0, 4.0, 8.0];
        let mut reducer = ChunkReducer::new(2);
        let mut metrics = vec![];
        for (i, &v) in values.iter().enumerate() {
            let partial = reducer.reduce(&chunk_1b1f1p(i, i..i + 1, &[v])).unwrap();
            for row in 0..partial.num_own_timesteps() {
                metrics.push(partial.metric_tfp[(row, 0, 0)]);
            }
        }
        // |4-1| and |8-2|.
        assert_eq!(metrics.len(), 2);
        assert_abs_diff_eq!(metrics[0], 3.0);
        assert_abs_diff_eq!(metrics[1], 6.0);
    }

    #[test]
    fn carry_never_holds_more_than_window_rows() {
        let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
        for window in 1..=3 {
            let mut reducer = ChunkReducer::new(window);
            let mut start = 0;
            let mut index = 0;
            while start < 10 {
                let end = (start + 4).min(10);
                reducer
                    .reduce(&chunk_1b1f1p(index, start..end, &values[start..end]))
                    .unwrap();
                let carry = reducer.carry.as_ref().unwrap();
                assert!(
                    carry.timesteps.len() <= window,
                    "window {window}: carry covers {:?}",
                    carry.timesteps
                );
                assert_eq!(carry.timesteps.end, end);
                start = end;
                index += 1;
            }
        }
    }

    #[test]
    fn flagged_baselines_are_left_out_of_the_mean() {
        let shape = (2, 2, 1, 1);
        let vis = Array4::from_shape_fn(shape, |(t, b, _, _)| {
            c32::new(if b == 0 { t as f32 } else { 10.0 * t as f32 }, 0.0)
        });
        let mut flags = Array4::from_elem(shape, false);
        // Flag the second baseline's later sample.
        flags[(1, 1, 0, 0)] = true;
        let chunk = Chunk {
            index: 0,
            timesteps: 0..2,
            vis,
            flags,
        };

        let mut reducer = ChunkReducer::new(1);
        let partial = reducer.reduce(&chunk).unwrap();
        // Only baseline 0 contributes: |1 - 0| = 1.
        assert_abs_diff_eq!(partial.metric_tfp[(0, 0, 0)], 1.0);
        assert_eq!(partial.num_samples, 1);
    }

    #[test]
    fn fully_flagged_row_is_nan() {
        let shape = (2, 1, 1, 1);
        let chunk = Chunk {
            index: 0,
            timesteps: 0..2,
            vis: Array4::from_elem(shape, c32::new(1.0, 0.0)),
            flags: Array4::from_elem(shape, true),
        };
        let mut reducer = ChunkReducer::new(1);
        let partial = reducer.reduce(&chunk).unwrap();
        assert!(partial.metric_tfp[(0, 0, 0)].is_nan());
        assert_eq!(partial.cells[(0, 0)].count, 0);
        assert_eq!(partial.cells[(0, 0)].flagged, 1);
    }

    #[test]
    fn no_diff_mode_averages_raw_amplitudes() {
        let values = [3.0, 4.0];
        let mut reducer = ChunkReducer::new(0);
        let partial = reducer.reduce(&chunk_1b1f1p(0, 0..2, &values)).unwrap();
        assert_eq!(partial.own_timesteps, 0..2);
        assert_abs_diff_eq!(partial.metric_tfp[(0, 0, 0)], 3.0);
        assert_abs_diff_eq!(partial.metric_tfp[(1, 0, 0)], 4.0);
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let mut reducer = ChunkReducer::new(1);
        reducer.reduce(&chunk_1b1f1p(0, 0..2, &values[..2])).unwrap();
        let result = reducer.reduce(&chunk_1b1f1p(2, 3..4, &values[3..]));
        assert_eq!(
            result.unwrap_err(),
            ReduceError::Discontiguous {
                expected: 2,
                got: 3
            }
        );
    }
}
