//! Reading visibilities from data container formats.

pub mod fits;
#[cfg(test)]
pub(crate) mod synthetic;
pub mod uvfits;

use std::ops::Range;

use marlu::c32;
use ndarray::ArrayViewMut4;
use thiserror::Error;

use crate::{selection::ResolvedSelection, ObsContext, VisInputType};

pub use uvfits::UvfitsReader;

/// Format-independent, forward-only access to a visibility source.
///
/// Implementations are expected to be cheap to construct (a metadata scan)
/// and to read data only when asked; selection is applied while reading, so
/// the caller's arrays are only ever as big as the selection.
pub trait VisRead: Send + Sync {
    fn get_obs_context(&self) -> &ObsContext;

    fn get_input_data_type(&self) -> VisInputType;

    /// Read a contiguous range of timesteps for the given selection into the
    /// supplied `(time, baseline, freq, pol)` arrays. Both arrays must have
    /// shape `(timesteps.len(), selection baselines, all freqs, selection
    /// pols)`.
    fn read_range(
        &self,
        vis_tbfp: ArrayViewMut4<c32>,
        flags_tbfp: ArrayViewMut4<bool>,
        timesteps: Range<usize>,
        selection: &ResolvedSelection,
    ) -> Result<(), VisReadError>;
}

#[derive(Error, Debug)]
pub enum VisReadError {
    #[error("Output {array_type} array has {got} elements on axis {axis_num}, expected {expected}")]
    BadArraySize {
        array_type: &'static str,
        axis_num: usize,
        expected: usize,
        got: usize,
    },

    #[error("Timestep range {start}..{end} is out of bounds for a source with {num_timesteps} timesteps")]
    BadTimestepRange {
        start: usize,
        end: usize,
        num_timesteps: usize,
    },

    #[error(transparent)]
    Uvfits(#[from] uvfits::UvfitsReadError),
}

/// Check that a caller-supplied output array matches the selection's shape.
pub(crate) fn check_shapes(
    array_type: &'static str,
    dim: (usize, usize, usize, usize),
    num_timesteps: usize,
    selection: &ResolvedSelection,
    num_freqs: usize,
) -> Result<(), VisReadError> {
    let expected = (
        num_timesteps,
        selection.num_baselines(),
        num_freqs,
        selection.num_pols(),
    );
    for (axis_num, (got, expected)) in [
        (dim.0, expected.0),
        (dim.1, expected.1),
        (dim.2, expected.2),
        (dim.3, expected.3),
    ]
    .into_iter()
    .enumerate()
    {
        if got != expected {
            return Err(VisReadError::BadArraySize {
                array_type,
                axis_num,
                expected,
                got,
            });
        }
    }
    Ok(())
}
