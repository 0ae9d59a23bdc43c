//! The streaming run: read chunks, reduce them, fold the partials.
//!
//! Reading/reducing and folding are pipelined over a bounded channel of
//! depth 1, so the reader may prepare chunk N+1 while chunk N's partial is
//! folded; only small, immutable [`PartialStatistics`] records cross the
//! thread boundary. Folds happen on one thread, in chunk order, because the
//! boundary-carried differencing makes order part of correctness, not just
//! of numerics. Cancellation is cooperative and checked between chunks; a
//! cancelled run yields no results at all, since a partial accumulator of
//! variance statistics is misleading.

use std::thread::scope;

use crossbeam_channel::bounded;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::{debug, info};
use scopeguard::defer_on_unwind;
use thiserror::Error;

use crate::{
    aggregate::{FoldError, GlobalStatistics},
    chunk::{chunk_size_for_budget, ChunkError, ChunkReader},
    read::VisRead,
    reduce::{ChunkReducer, ReduceError},
    results::{materialize, ResultArrays, ResultsError},
    selection::ResolvedSelection,
};

/// Used to pick a chunk size when the caller gives neither a chunk size nor
/// a budget.
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 1024 * 1024 * 1024;

pub struct RunConfig {
    /// Timesteps per chunk. Derived from the memory budget if not given.
    pub chunk_size: Option<usize>,

    /// Advisory ceiling on one chunk's raw arrays.
    pub memory_budget_bytes: Option<usize>,

    /// Time-differencing window; 0 disables differencing.
    pub window: usize,

    /// Process only the first N timesteps of the source.
    pub time_limit: Option<usize>,

    /// |z| beyond which a row counts towards occupancy.
    pub zscore_threshold: f64,

    /// Whether a zero-sample cell aborts the run instead of being
    /// NaN-masked.
    pub strict: bool,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            chunk_size: None,
            memory_budget_bytes: None,
            window: 1,
            time_limit: None,
            zscore_threshold: 5.0,
            strict: false,
        }
    }
}

/// Run the whole engine over one source. Returns only on a complete,
/// fully-folded pass; every other outcome is an error.
pub fn run(
    reader: &dyn VisRead,
    selection: &ResolvedSelection,
    config: &RunConfig,
    cancel: &AtomicCell<bool>,
    read_progress: Option<ProgressBar>,
    fold_progress: Option<ProgressBar>,
) -> Result<ResultArrays, RunError> {
    let obs_context = reader.get_obs_context();
    let num_timesteps = match config.time_limit {
        Some(limit) => obs_context.timestamps.len().min(limit),
        None => obs_context.timestamps.len(),
    };
    let num_freqs = obs_context.num_freqs();

    let chunk_size = match (config.chunk_size, config.memory_budget_bytes) {
        (Some(chunk_size), _) => chunk_size.max(1),
        (None, Some(budget)) => chunk_size_for_budget(budget, selection, num_freqs),
        (None, None) => chunk_size_for_budget(DEFAULT_MEMORY_BUDGET_BYTES, selection, num_freqs),
    };
    let num_chunks = num_timesteps.div_ceil(chunk_size);
    debug!(
        "Processing {num_timesteps} timesteps in {num_chunks} chunks of up to {chunk_size}"
    );
    if let Some(pb) = &read_progress {
        pb.set_length(num_chunks as u64);
    }
    if let Some(pb) = &fold_progress {
        pb.set_length(num_chunks as u64);
    }

    // One in-flight partial: the reader side may be at most one chunk ahead
    // of the folder.
    let (tx, rx) = bounded(1);
    let error = AtomicCell::new(false);
    let error = &error;

    let result = scope(|s| {
        let reader_handle = s.spawn(move || {
            defer_on_unwind! { error.store(true); }

            let mut chunks =
                ChunkReader::new(
                    reader,
                    selection,
                    chunk_size,
                    config.memory_budget_bytes,
                    config.time_limit,
                );
            let mut reducer = ChunkReducer::new(config.window);
            loop {
                if cancel.load() {
                    debug!("Reader thread saw the cancellation flag");
                    return Err(RunError::Cancelled);
                }
                if error.load() {
                    return Ok(());
                }

                let chunk = match chunks.next_chunk() {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        error.store(true);
                        return Err(RunError::from(e));
                    }
                };
                let partial = match reducer.reduce(&chunk) {
                    Ok(partial) => partial,
                    Err(e) => {
                        error.store(true);
                        return Err(RunError::from(e));
                    }
                };
                // The chunk's raw arrays drop here; only the partial record
                // survives.
                drop(chunk);
                if let Some(pb) = &read_progress {
                    pb.inc(1);
                }

                // A send error means the folder is gone; it has set the
                // error flag with the real cause.
                if tx.send(partial).is_err() {
                    return Ok(());
                }
            }

            drop(tx);
            if let Some(pb) = &read_progress {
                pb.finish_with_message("Read");
            }
            Ok(())
        });

        // `rx` moves in, so it drops as soon as folding stops for any
        // reason and a blocked reader send unblocks with an error.
        let fold_result = (move || {
            defer_on_unwind! { error.store(true); }

            let mut global = GlobalStatistics::new(
                num_freqs,
                selection.num_pols(),
                config.window.min(num_timesteps),
            );
            for partial in rx {
                if let Err(e) = global.fold(&partial) {
                    error.store(true);
                    return Err(RunError::from(e));
                }
                if let Some(pb) = &fold_progress {
                    pb.inc(1);
                }
            }
            if let Some(pb) = &fold_progress {
                pb.finish_with_message("Folded");
            }
            Ok(global)
        })();

        let read_result = reader_handle.join().unwrap();
        match (read_result, fold_result) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(global)) => Ok(global),
        }
    });
    let global = result?;

    // The flag may have been raised after the reader finished.
    if cancel.load() {
        debug!("Cancelled after the last fold; discarding the accumulator");
        return Err(RunError::Cancelled);
    }

    info!(
        "Folded {} chunks, {} rows, {} baseline-samples",
        global.num_folded_chunks(),
        global.num_rows(),
        global.num_samples()
    );
    let results = materialize(
        &global,
        obs_context,
        &selection.pols,
        config.zscore_threshold,
        config.strict,
    )?;
    Ok(results)
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("The run was cancelled; partial statistics have been discarded")]
    Cancelled,

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Fold(#[from] FoldError),

    #[error(transparent)]
    Results(#[from] ResultsError),
}
