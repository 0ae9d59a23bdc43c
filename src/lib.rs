//! Streaming incoherent-noise-spectrum (SSINS) statistics over visibility
//! data in bounded memory. Visibilities are read in contiguous time chunks,
//! each chunk is reduced to small value-semantic partial statistics, and the
//! partials are folded in source order into one running accumulator; raw
//! sample data for at most one chunk (plus a small boundary carry) is
//! resident at any time.

pub mod aggregate;
pub mod chunk;
pub mod pipeline;
pub mod read;
pub mod reduce;
pub mod results;
pub mod selection;

use hifitime::{Duration, Epoch};
use vec1::Vec1;

use crate::selection::Pol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisInputType {
    Uvfits,
}

/// Observation metadata, populated once when a visibility source is opened.
#[derive(Clone)]
pub struct ObsContext {
    /// The unique timestamps in the observation. These are stored as
    /// `hifitime` [Epoch] structs to help keep the code flexible. These
    /// include timestamps that are deemed "flagged" by the observation.
    pub timestamps: Vec1<Epoch>,

    /// The *available* timestep indices of the input data. This does not
    /// necessarily start at 0, and is not necessarily regular (e.g. a valid
    /// vector could be [1, 2, 4]).
    pub all_timesteps: Vec1<usize>,

    /// The timestep indices of the input data that aren't totally flagged.
    ///
    /// This is allowed to be empty.
    pub unflagged_timesteps: Vec<usize>,

    /// The names of each of the tiles in the input data. This includes
    /// flagged and unavailable tiles.
    pub tile_names: Vec1<String>,

    /// The tile-index pairs of the baseline rows within one timestep, in the
    /// order the source stores them. Auto-correlations have equal indices.
    pub ant_pairs: Vec1<(usize, usize)>,

    /// The polarisations present in the data, in storage order.
    pub pols: Vec1<Pol>,

    /// The time resolution of the supplied data. This is not necessarily the
    /// native time resolution of the original observation's data, as it may
    /// have already been averaged.
    pub time_res: Duration,

    /// The fine-channel resolution of the supplied data \[Hz\].
    pub freq_res: f64,

    /// All of the fine-channel frequencies within the data \[Hz\]. The values
    /// reflect the frequencies at the *centre* of each channel.
    ///
    /// These are kept as ints to help some otherwise error-prone calculations
    /// using floats. By using ints, we assume there is no sub-Hz structure.
    pub fine_chan_freqs: Vec1<u64>,
}

impl ObsContext {
    pub fn num_baselines(&self) -> usize {
        self.ant_pairs.len()
    }

    pub fn num_freqs(&self) -> usize {
        self.fine_chan_freqs.len()
    }

    pub fn num_pols(&self) -> usize {
        self.pols.len()
    }
}
