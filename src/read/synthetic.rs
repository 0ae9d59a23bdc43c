//! An in-memory `VisRead` implementation for tests. Holds the full
//! `(time, baseline, freq, pol)` arrays and serves any contiguous timestep
//! range from them, so chunked reads can be compared against whole-pass
//! reads without touching the filesystem.

use std::ops::Range;

use crossbeam_utils::atomic::AtomicCell;
use hifitime::{Duration, Epoch};
use marlu::c32;
use ndarray::{Array4, ArrayViewMut4};
use vec1::Vec1;

use super::{check_shapes, VisRead, VisReadError};
use crate::{
    selection::{Pol, ResolvedSelection},
    ObsContext, VisInputType,
};

pub(crate) struct SyntheticReader {
    obs_context: ObsContext,
    vis: Array4<c32>,
    flags: Array4<bool>,
    /// The widest timestep range any single `read_range` call asked for.
    /// Lets tests assert that a chunked run never requests more rows at once
    /// than the chunk size.
    max_rows_served: AtomicCell<usize>,
}

/// All cross-correlation pairs of `num_tiles` tiles, in the usual
/// upper-triangle order.
pub(crate) fn cross_pairs(num_tiles: usize) -> Vec<(usize, usize)> {
    let mut pairs = vec![];
    for a1 in 0..num_tiles {
        for a2 in (a1 + 1)..num_tiles {
            pairs.push((a1, a2));
        }
    }
    pairs
}

impl SyntheticReader {
    /// Build a reader around full `(time, baseline, freq, pol)` arrays. The
    /// baseline axis must match `ant_pairs`.
    pub(crate) fn new(
        vis: Array4<c32>,
        flags: Array4<bool>,
        ant_pairs: Vec<(usize, usize)>,
        pols: Vec<Pol>,
    ) -> SyntheticReader {
        let (num_times, num_baselines, num_freqs, num_pols) = vis.dim();
        assert_eq!(vis.dim(), flags.dim());
        assert_eq!(num_baselines, ant_pairs.len());
        assert_eq!(num_pols, pols.len());

        let num_tiles = ant_pairs
            .iter()
            .map(|&(a1, a2)| a1.max(a2) + 1)
            .max()
            .unwrap_or(1);
        let time_res = Duration::from_seconds(2.0);
        let timestamps: Vec<Epoch> = (0..num_times)
            .map(|i| Epoch::from_gpst_seconds(1090008640.0) + time_res * i as f64)
            .collect();
        let all_timesteps: Vec<usize> = (0..num_times).collect();

        let obs_context = ObsContext {
            timestamps: Vec1::try_from_vec(timestamps).unwrap(),
            all_timesteps: Vec1::try_from_vec(all_timesteps.clone()).unwrap(),
            unflagged_timesteps: all_timesteps,
            tile_names: Vec1::try_from_vec(
                (0..num_tiles).map(|i| format!("Tile{i:03}")).collect(),
            )
            .unwrap(),
            ant_pairs: Vec1::try_from_vec(ant_pairs).unwrap(),
            pols: Vec1::try_from_vec(pols).unwrap(),
            time_res,
            freq_res: 40e3,
            fine_chan_freqs: Vec1::try_from_vec(
                (0..num_freqs).map(|i| 167_035_000 + 40_000 * i as u64).collect(),
            )
            .unwrap(),
        };

        SyntheticReader {
            obs_context,
            vis,
            flags,
            max_rows_served: AtomicCell::new(0),
        }
    }

    pub(crate) fn max_rows_served(&self) -> usize {
        self.max_rows_served.load()
    }
}

impl VisRead for SyntheticReader {
    fn get_obs_context(&self) -> &ObsContext {
        &self.obs_context
    }

    fn get_input_data_type(&self) -> VisInputType {
        VisInputType::Uvfits
    }

    fn read_range(
        &self,
        mut vis_tbfp: ArrayViewMut4<c32>,
        mut flags_tbfp: ArrayViewMut4<bool>,
        timesteps: Range<usize>,
        selection: &ResolvedSelection,
    ) -> Result<(), VisReadError> {
        let num_timesteps = self.obs_context.timestamps.len();
        if timesteps.end > num_timesteps || timesteps.start > timesteps.end {
            return Err(VisReadError::BadTimestepRange {
                start: timesteps.start,
                end: timesteps.end,
                num_timesteps,
            });
        }
        let num_freqs = self.obs_context.num_freqs();
        check_shapes("vis", vis_tbfp.dim(), timesteps.len(), selection, num_freqs)?;
        check_shapes(
            "flags",
            flags_tbfp.dim(),
            timesteps.len(),
            selection,
            num_freqs,
        )?;
        self.max_rows_served.fetch_max(timesteps.len());

        for (i_t, t) in timesteps.enumerate() {
            for (i_bl, &row) in selection.baselines.iter().enumerate() {
                for i_freq in 0..num_freqs {
                    for (i_pol, &src_pol) in selection.pol_indices.iter().enumerate() {
                        vis_tbfp[(i_t, i_bl, i_freq, i_pol)] = self.vis[(t, row, i_freq, src_pol)];
                        flags_tbfp[(i_t, i_bl, i_freq, i_pol)] =
                            self.flags[(t, row, i_freq, src_pol)];
                    }
                }
            }
        }
        Ok(())
    }
}
