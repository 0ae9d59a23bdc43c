//! Deriving final arrays from the folded statistics.
//!
//! Everything here is a pure function of [`GlobalStatistics`] plus the
//! observation metadata; nothing feeds back into the pipeline. The TSV
//! output is one file per (statistic, polarisation): one row per time
//! sample indexed by GPS time, one column per fine channel, matching what
//! the plotting scripts consume.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;
use ndarray::{Array2, Array3};
use thiserror::Error;

use crate::{aggregate::GlobalStatistics, selection::Pol, ObsContext};

/// Immutable derived arrays. Axes are `(time, freq, pol)` for the per-row
/// arrays and `(freq, pol)` for the aggregated ones.
pub struct ResultArrays {
    pub pols: Vec<Pol>,
    /// Centre frequency of each fine channel \[Hz\].
    pub freqs_hz: Vec<u64>,
    /// Source timestep index of each row.
    pub row_timesteps: Vec<usize>,
    /// GPS time of each row \[s\].
    pub gps_times: Vec<f64>,

    /// The noise-spectrum metric. NaN where every baseline was flagged.
    pub metric_tfp: Array3<f64>,
    /// Per-row z-scores against the per-cell mean and standard deviation.
    pub zscore_tfp: Array3<f64>,

    pub mean_fp: Array2<f64>,
    pub std_fp: Array2<f64>,
    pub min_fp: Array2<f64>,
    pub max_fp: Array2<f64>,
    /// Fraction of rows per cell that are flagged or beyond the z-score
    /// threshold.
    pub occupancy_fp: Array2<f64>,
    /// Fraction of rows per cell with no unflagged baseline at all.
    pub flag_occupancy_fp: Array2<f64>,

    /// Baseline-samples that contributed, after flagging.
    pub num_samples: u64,
}

impl ResultArrays {
    pub fn num_rows(&self) -> usize {
        self.row_timesteps.len()
    }

    /// The largest occupancy over all cells, for run summaries.
    pub fn max_occupancy(&self) -> f64 {
        self.occupancy_fp
            .iter()
            .copied()
            .filter(|o| !o.is_nan())
            .fold(f64::NAN, f64::max)
    }

    /// Write one polarisation slice of a per-row array as tab-separated
    /// values: a `gps_time` index column, then one column per fine channel
    /// (labelled in MHz).
    fn write_tsv(
        &self,
        path: &Path,
        array: &Array3<f64>,
        i_pol: usize,
    ) -> Result<(), ResultsError> {
        let mut out = BufWriter::new(File::create(path)?);

        write!(out, "gps_time")?;
        for &freq in &self.freqs_hz {
            write!(out, "\t{:.4}", freq as f64 / 1e6)?;
        }
        writeln!(out)?;

        for (i_row, gps) in self.gps_times.iter().enumerate() {
            write!(out, "{gps:.3}")?;
            for i_freq in 0..self.freqs_hz.len() {
                write!(out, "\t{:.3}", array[(i_row, i_freq, i_pol)])?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write every (statistic, polarisation) pair as
    /// `{obsname}.{stat}{suffix}.{pol}.tsv` under `outdir`, where the
    /// statistics are `vis_amps` (the metric) and `z_score`. Returns the
    /// written paths.
    pub fn write_tsv_set(
        &self,
        outdir: &Path,
        obsname: &str,
        suffix: &str,
    ) -> Result<Vec<PathBuf>, ResultsError> {
        let mut written = Vec::with_capacity(2 * self.pols.len());
        for (name, array) in [("vis_amps", &self.metric_tfp), ("z_score", &self.zscore_tfp)] {
            for (i_pol, pol) in self.pols.iter().enumerate() {
                let path = outdir.join(format!("{obsname}.{name}{suffix}.{pol}.tsv"));
                self.write_tsv(&path, array, i_pol)?;
                written.push(path);
            }
        }
        Ok(written)
    }
}

/// Compute the derived arrays from a finished accumulator.
///
/// A cell with zero contributing rows can't have a mean or standard
/// deviation; in strict mode that's an error, otherwise the cell is
/// NaN-masked and reported in the log.
pub fn materialize(
    global: &GlobalStatistics,
    obs_context: &ObsContext,
    pols: &[Pol],
    zscore_threshold: f64,
    strict: bool,
) -> Result<ResultArrays, ResultsError> {
    let num_rows = global.num_rows();
    if num_rows == 0 {
        return Err(ResultsError::NoRows);
    }
    let freqs_hz: Vec<u64> = obs_context.fine_chan_freqs.to_vec();
    let (num_freqs, num_pols) = global.cells().dim();

    let mut mean_fp = Array2::zeros((num_freqs, num_pols));
    let mut std_fp = Array2::zeros((num_freqs, num_pols));
    let mut min_fp = Array2::zeros((num_freqs, num_pols));
    let mut max_fp = Array2::zeros((num_freqs, num_pols));
    let mut flag_occupancy_fp = Array2::zeros((num_freqs, num_pols));
    for ((i_freq, i_pol), cell) in global.cells().indexed_iter() {
        if cell.count == 0 {
            if strict {
                return Err(ResultsError::InsufficientSamples {
                    freq_hz: freqs_hz[i_freq],
                    pol: pols[i_pol],
                });
            }
            warn!(
                "No unflagged samples at {} Hz, {}; its statistics are NaN",
                freqs_hz[i_freq], pols[i_pol]
            );
        }
        mean_fp[(i_freq, i_pol)] = cell.mean();
        std_fp[(i_freq, i_pol)] = cell.std();
        min_fp[(i_freq, i_pol)] = if cell.count == 0 { f64::NAN } else { cell.min };
        max_fp[(i_freq, i_pol)] = if cell.count == 0 { f64::NAN } else { cell.max };
        flag_occupancy_fp[(i_freq, i_pol)] =
            cell.flagged as f64 / (cell.count + cell.flagged) as f64;
    }

    let metric_tfp = global.metric_tfp().clone();
    let mut zscore_tfp = Array3::zeros((num_rows, num_freqs, num_pols));
    let mut occupancy_fp = Array2::zeros((num_freqs, num_pols));
    for ((i_row, i_freq, i_pol), &metric) in metric_tfp.indexed_iter() {
        let std = std_fp[(i_freq, i_pol)];
        let z = if std > 0.0 {
            (metric - mean_fp[(i_freq, i_pol)]) / std
        } else {
            f64::NAN
        };
        zscore_tfp[(i_row, i_freq, i_pol)] = z;
        // A row is occupied if it was fully flagged (NaN metric) or detected
        // above the threshold. A valid metric in a zero-variance cell has no
        // z-score but is not occupied.
        if metric.is_nan() || (std > 0.0 && z.abs() > zscore_threshold) {
            occupancy_fp[(i_freq, i_pol)] += 1.0;
        }
    }
    occupancy_fp.mapv_inplace(|o| o / num_rows as f64);

    let row_timesteps = global.row_timesteps().to_vec();
    let gps_times = row_timesteps
        .iter()
        .map(|&t| obs_context.timestamps[t].to_gpst_seconds())
        .collect();

    Ok(ResultArrays {
        pols: pols.to_vec(),
        freqs_hz,
        row_timesteps,
        gps_times,
        metric_tfp,
        zscore_tfp,
        mean_fp,
        std_fp,
        min_fp,
        max_fp,
        occupancy_fp,
        flag_occupancy_fp,
        num_samples: global.num_samples(),
    })
}

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("The accumulator contains no rows; nothing to materialize")]
    NoRows,

    #[error("No unflagged samples at {freq_hz} Hz, {pol}; cannot compute statistics in strict mode")]
    InsufficientSamples { freq_hz: u64, pol: Pol },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::ops::Range;

    use approx::assert_abs_diff_eq;
    use hifitime::{Duration, Epoch};
    use ndarray::{Array2, Array3};
    use vec1::{vec1, Vec1};

    use super::*;
    use crate::aggregate::{CellStats, PartialStatistics};

    fn test_context(num_times: usize) -> ObsContext {
        let time_res = Duration::from_seconds(2.0);
        let timestamps: Vec<Epoch> = (0..num_times)
            .map(|i| Epoch::from_gpst_seconds(1090008640.0) + time_res * i as f64)
            .collect();
        let all_timesteps: Vec<usize> = (0..num_times).collect();
        ObsContext {
            timestamps: Vec1::try_from_vec(timestamps).unwrap(),
            all_timesteps: Vec1::try_from_vec(all_timesteps.clone()).unwrap(),
            unflagged_timesteps: all_timesteps,
            tile_names: vec1!["Tile011".to_string(), "Tile012".to_string()],
            ant_pairs: vec1![(0, 1)],
            pols: vec1![Pol::XX],
            time_res,
            freq_res: 40e3,
            fine_chan_freqs: vec1![167035000, 167075000],
        }
    }

    fn global_with_rows(rows: &[[f64; 2]], own_timesteps: Range<usize>) -> GlobalStatistics {
        let mut metric_tfp = Array3::zeros((rows.len(), 2, 1));
        let mut cells = Array2::<CellStats>::default((2, 1));
        for (i_row, row) in rows.iter().enumerate() {
            for (i_freq, &value) in row.iter().enumerate() {
                metric_tfp[(i_row, i_freq, 0)] = value;
                cells[(i_freq, 0)].update(value);
            }
        }
        let mut global = GlobalStatistics::new(2, 1, own_timesteps.start);
        global
            .fold(&PartialStatistics {
                chunk_index: 0,
                own_timesteps,
                metric_tfp,
                cells,
                num_samples: (rows.len() * 2) as u64,
            })
            .unwrap();
        global
    }

    #[test]
    fn zscores_are_standardized_per_cell() {
        let rows = [[1.0, 10.0], [3.0, 10.0], [2.0, 40.0], [2.0, 20.0]];
        let global = global_with_rows(&rows, 1..5);
        let obs_context = test_context(6);
        let results = materialize(&global, &obs_context, &[Pol::XX], 5.0, false).unwrap();

        // Freq 0: mean 2, population std sqrt(1/2).
        assert_abs_diff_eq!(results.mean_fp[(0, 0)], 2.0, epsilon = 1e-12);
        let std0 = (0.5_f64).sqrt();
        assert_abs_diff_eq!(results.std_fp[(0, 0)], std0, epsilon = 1e-12);
        assert_abs_diff_eq!(results.zscore_tfp[(0, 0, 0)], -1.0 / std0, epsilon = 1e-12);
        assert_abs_diff_eq!(results.zscore_tfp[(1, 0, 0)], 1.0 / std0, epsilon = 1e-12);
    }

    #[test]
    fn occupancy_counts_threshold_crossings() {
        // Freq 1 has one clear outlier among mostly-flat rows.
        let rows = [[1.0, 10.0], [1.0, 10.0], [1.0, 10.0], [1.0, 10.0], [1.0, 100.0]];
        let global = global_with_rows(&rows, 1..6);
        let obs_context = test_context(7);
        let results = materialize(&global, &obs_context, &[Pol::XX], 1.5, false).unwrap();

        assert_abs_diff_eq!(results.occupancy_fp[(1, 0)], 0.2, epsilon = 1e-12);
        // Freq 0 is constant and fully unflagged: zero variance means no
        // z-score, but nothing is occupied either.
        assert_abs_diff_eq!(results.occupancy_fp[(0, 0)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(results.max_occupancy(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn zero_sample_cell_is_an_error_only_in_strict_mode() {
        let rows = [[f64::NAN, 10.0], [f64::NAN, 12.0]];
        let global = global_with_rows(&rows, 1..3);
        let obs_context = test_context(4);

        let strict = materialize(&global, &obs_context, &[Pol::XX], 5.0, true);
        assert!(matches!(
            strict,
            Err(ResultsError::InsufficientSamples {
                freq_hz: 167035000,
                pol: Pol::XX,
            })
        ));

        let lenient = materialize(&global, &obs_context, &[Pol::XX], 5.0, false).unwrap();
        assert!(lenient.mean_fp[(0, 0)].is_nan());
        assert_abs_diff_eq!(lenient.flag_occupancy_fp[(0, 0)], 1.0);
        assert_abs_diff_eq!(lenient.occupancy_fp[(0, 0)], 1.0);
        assert_abs_diff_eq!(lenient.mean_fp[(1, 0)], 11.0, epsilon = 1e-12);
    }

    #[test]
    fn tsv_set_writes_one_file_per_statistic_and_pol() {
        let rows = [[1.0, 10.0], [3.0, 20.0]];
        let global = global_with_rows(&rows, 1..3);
        let obs_context = test_context(4);
        let results = materialize(&global, &obs_context, &[Pol::XX], 5.0, false).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let written = results
            .write_tsv_set(dir.path(), "1090008640", ".diff")
            .unwrap();
        // The statistic name comes before the suffix.
        assert_eq!(
            written,
            [
                dir.path().join("1090008640.vis_amps.diff.XX.tsv"),
                dir.path().join("1090008640.z_score.diff.XX.tsv"),
            ]
        );

        let contents = std::fs::read_to_string(&written[0]).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "gps_time\t167.0350\t167.0750");
        assert_eq!(lines.next().unwrap(), "1090008642.000\t1.000\t10.000");
        assert_eq!(lines.next().unwrap(), "1090008644.000\t3.000\t20.000");
        assert!(lines.next().is_none());

        // Both rows deviate from the per-cell mean by exactly one population
        // standard deviation.
        let z_contents = std::fs::read_to_string(&written[1]).unwrap();
        let mut z_lines = z_contents.lines().skip(1);
        assert_eq!(z_lines.next().unwrap(), "1090008642.000\t-1.000\t-1.000");
        assert_eq!(z_lines.next().unwrap(), "1090008644.000\t1.000\t1.000");
    }
}
