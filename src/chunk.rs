//! Splitting a visibility source into bounded time chunks.
//!
//! A [`ChunkReader`] walks a source forward-only, yielding contiguous,
//! non-overlapping timestep ranges whose union is the whole source. Only the
//! chunk currently handed to the caller is resident; nothing is pre-read or
//! cached behind it.

use std::ops::Range;
use std::time::Instant;

use log::{debug, warn};
use marlu::c32;
use ndarray::Array4;
use thiserror::Error;

use crate::{
    read::{VisRead, VisReadError},
    selection::ResolvedSelection,
};

/// Bytes of raw sample data per timestep for a given selection: one complex
/// visibility and one flag per (baseline, freq, pol) cell.
pub fn bytes_per_timestep(selection: &ResolvedSelection, num_freqs: usize) -> usize {
    selection.num_baselines()
        * num_freqs
        * selection.num_pols()
        * (std::mem::size_of::<c32>() + std::mem::size_of::<bool>())
}

/// Pick the largest chunk size (in timesteps) whose raw arrays fit in
/// `budget_bytes`, with a floor of one timestep.
pub fn chunk_size_for_budget(
    budget_bytes: usize,
    selection: &ResolvedSelection,
    num_freqs: usize,
) -> usize {
    (budget_bytes / bytes_per_timestep(selection, num_freqs)).max(1)
}

/// One contiguous slice of time samples, read with the run's selection
/// applied. Transient: reduced to partial statistics and dropped.
pub struct Chunk {
    /// 0-based position of this chunk in the reading pass.
    pub index: usize,

    /// Half-open timestep range `[start, end)` into the source.
    pub timesteps: Range<usize>,

    /// Visibilities, shape `(time, baseline, freq, pol)`.
    pub vis: Array4<c32>,

    /// Flags, same shape as `vis`. `true` means the sample doesn't
    /// contribute.
    pub flags: Array4<bool>,
}

impl Chunk {
    pub fn num_timesteps(&self) -> usize {
        self.timesteps.len()
    }
}

/// Forward-only chunk sequence over a visibility source. Ends by returning
/// `Ok(None)`; any error aborts the pass.
pub struct ChunkReader<'a> {
    reader: &'a dyn VisRead,
    selection: &'a ResolvedSelection,
    num_timesteps: usize,
    num_freqs: usize,
    chunk_size: usize,
    /// Advisory ceiling on one chunk's raw arrays. A chunk that would exceed
    /// it is shrunk (halved) once; exceeding it again is an error.
    memory_budget_bytes: Option<usize>,
    cursor: usize,
    next_index: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(
        reader: &'a dyn VisRead,
        selection: &'a ResolvedSelection,
        chunk_size: usize,
        memory_budget_bytes: Option<usize>,
        time_limit: Option<usize>,
    ) -> ChunkReader<'a> {
        let obs_context = reader.get_obs_context();
        let num_timesteps = match time_limit {
            Some(limit) => obs_context.timestamps.len().min(limit),
            None => obs_context.timestamps.len(),
        };
        ChunkReader {
            reader,
            selection,
            num_timesteps,
            num_freqs: obs_context.num_freqs(),
            chunk_size: chunk_size.max(1),
            memory_budget_bytes,
            cursor: 0,
            next_index: 0,
        }
    }

    /// Read the next chunk, or `None` once the source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        if self.cursor >= self.num_timesteps {
            return Ok(None);
        }

        let start = self.cursor;
        let mut end = (start + self.chunk_size).min(self.num_timesteps);
        if let Some(budget) = self.memory_budget_bytes {
            let per_timestep = bytes_per_timestep(self.selection, self.num_freqs);
            if (end - start) * per_timestep > budget {
                // Shrink this chunk once. Shrinking again would mean the
                // budget can't hold even a halved chunk; give up then.
                let halved = ((end - start) / 2).max(1);
                warn!(
                    "Chunk {}..{} exceeds the memory budget; shrinking to {} timesteps",
                    start,
                    end,
                    halved
                );
                end = start + halved;
                if (end - start) * per_timestep > budget {
                    return Err(ChunkError::BudgetExceeded {
                        start,
                        end,
                        required_bytes: (end - start) * per_timestep,
                        budget_bytes: budget,
                    });
                }
            }
        }

        let num_chunk_timesteps = end - start;
        let shape = (
            num_chunk_timesteps,
            self.selection.num_baselines(),
            self.num_freqs,
            self.selection.num_pols(),
        );
        let mut vis = Array4::zeros(shape);
        let mut flags = Array4::from_elem(shape, false);
        debug!("Reading chunk {} (timesteps {start}..{end})", self.next_index);
        let read_start = Instant::now();
        self.reader
            .read_range(vis.view_mut(), flags.view_mut(), start..end, self.selection)
            .map_err(|err| ChunkError::Read { start, end, err })?;
        let read_time = read_start.elapsed().as_secs_f64();
        let chunk_mb =
            (num_chunk_timesteps * bytes_per_timestep(self.selection, self.num_freqs)) as f64
                / (1024.0 * 1024.0);
        debug!(
            "Read chunk {} ({chunk_mb:.0} MB) in {read_time:.1}s, {:.0} MB/s",
            self.next_index,
            chunk_mb / read_time.max(1e-9)
        );

        let chunk = Chunk {
            index: self.next_index,
            timesteps: start..end,
            vis,
            flags,
        };
        self.cursor = end;
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Chunk covering timesteps {start}..{end} needs {required_bytes} bytes even after shrinking, but the memory budget is {budget_bytes} bytes")]
    BudgetExceeded {
        start: usize,
        end: usize,
        required_bytes: usize,
        budget_bytes: usize,
    },

    #[error("While reading the chunk covering timesteps {start}..{end}: {err}")]
    Read {
        start: usize,
        end: usize,
        err: VisReadError,
    },
}
