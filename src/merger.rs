//! K-way merging of sorted runs through the loser tree.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::chunk::RunWriter;
use crate::control::{CancelToken, ProgressFn, ProgressMeter, SortPhase};
use crate::loser_tree::LoserTree;
use crate::reader::RunReader;
use crate::record::{self, Record};
use crate::temp::TempRegistry;

/// Merge width bounds; the upper bound caps open file handles.
pub const MIN_MERGE_WIDTH: usize = 8;
pub const MAX_MERGE_WIDTH: usize = 64;

/// Cancellation poll interval in merged records.
const CANCEL_POLL_MASK: u64 = (64 * 1024) - 1;

/// Nominal merge width is four runs per worker, clamped to the handle
/// bounds.
pub fn derive_merge_width(parallel: usize) -> usize {
    (parallel * 4).clamp(MIN_MERGE_WIDTH, MAX_MERGE_WIDTH)
}

/// Merging error.
#[derive(Debug)]
pub enum MergeError {
    /// An intermediate run could not be read or written.
    Run(io::Error),
    /// A compressed stream failed to encode or decode.
    Codec(io::Error),
    /// The final target could not be created or written.
    Target(io::Error),
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MergeError::Run(err) | MergeError::Codec(err) | MergeError::Target(err) => Some(err),
            MergeError::Cancelled => None,
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Run(err) => write!(f, "intermediate run I/O failed: {}", err),
            MergeError::Codec(err) => write!(f, "compressed stream failed: {}", err),
            MergeError::Target(err) => write!(f, "target file I/O failed: {}", err),
            MergeError::Cancelled => write!(f, "merge cancelled"),
        }
    }
}

/// Head record of one source: the descriptor plus the reader index used
/// to replenish after consumption.
#[derive(Clone, Copy)]
struct MergeEntry {
    record: Record,
    source: usize,
}

/// Multi-pass k-way merger.
///
/// A single pass merges up to `width` runs through a [`LoserTree`].
/// With more runs than the width, runs are merged batch-wise into
/// compressed intermediates, pass after pass, until one pass can
/// produce the uncompressed target.
pub struct Merger<'a> {
    registry: &'a TempRegistry,
    pool: &'a rayon::ThreadPool,
    width: usize,
    parallel_merges: usize,
    cancel: &'a CancelToken,
    progress: Option<&'a ProgressFn>,
}

impl<'a> Merger<'a> {
    pub fn new(
        registry: &'a TempRegistry,
        pool: &'a rayon::ThreadPool,
        width: usize,
        parallel_merges: usize,
        cancel: &'a CancelToken,
        progress: Option<&'a ProgressFn>,
    ) -> Merger<'a> {
        Merger {
            registry,
            pool,
            width,
            parallel_merges: parallel_merges.max(1),
            cancel,
            progress,
        }
    }

    /// Merges `sources` into `target`. `compressed` states whether the
    /// sources are zstd streams; every intermediate this produces is,
    /// the target never.
    pub fn merge(
        &self,
        mut sources: Vec<PathBuf>,
        mut compressed: bool,
        target: &Path,
    ) -> Result<(), MergeError> {
        let meter = ProgressMeter::new(
            self.progress,
            SortPhase::Merging,
            plan_total_merges(sources.len(), self.width),
        );

        let mut pass = 1usize;
        while sources.len() > self.width {
            if self.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            log::debug!(
                "merge pass {}: {} runs, width {}",
                pass,
                sources.len(),
                self.width
            );

            let jobs: Vec<(Vec<PathBuf>, PathBuf)> = sources
                .chunks(self.width)
                .enumerate()
                .map(|(batch, runs)| (runs.to_vec(), self.registry.merge_path(pass, batch)))
                .collect();

            self.run_pass(&jobs, compressed, &meter)?;

            self.registry.discard(&sources);
            sources = jobs.into_iter().map(|(_, output)| output).collect();
            compressed = true;
            pass += 1;
        }

        self.merge_streams(&sources, compressed, target, false, true)?;
        self.registry.discard(&sources);
        meter.advance(1);
        Ok(())
    }

    /// Runs one pass's batch merges, at most `parallel_merges` at a
    /// time so a pass cannot saturate the device.
    fn run_pass(
        &self,
        jobs: &[(Vec<PathBuf>, PathBuf)],
        compressed: bool,
        meter: &ProgressMeter<'_>,
    ) -> Result<(), MergeError> {
        let failure: Mutex<Option<MergeError>> = Mutex::new(None);

        for wave in jobs.chunks(self.parallel_merges) {
            if self.cancel.is_cancelled() || lock(&failure).is_some() {
                break;
            }
            self.pool.scope(|scope| {
                for job in wave {
                    let (batch, output) = job;
                    let failure = &failure;
                    scope.spawn(move |_| {
                        if self.cancel.is_cancelled() || lock(failure).is_some() {
                            return;
                        }
                        match self.merge_streams(batch, compressed, output, true, false) {
                            Ok(()) => meter.advance(1),
                            Err(err) => {
                                let mut slot = lock(failure);
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                        }
                    });
                }
            });
        }

        if let Some(err) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        Ok(())
    }

    /// Merges one batch of sorted runs into `target`.
    fn merge_streams(
        &self,
        sources: &[PathBuf],
        inputs_compressed: bool,
        target: &Path,
        compress_output: bool,
        final_target: bool,
    ) -> Result<(), MergeError> {
        let map_in = |err: io::Error| {
            if inputs_compressed {
                MergeError::Codec(err)
            } else {
                MergeError::Run(err)
            }
        };
        let map_out = |err: io::Error| {
            if compress_output {
                MergeError::Codec(err)
            } else if final_target {
                MergeError::Target(err)
            } else {
                MergeError::Run(err)
            }
        };

        let mut readers = Vec::with_capacity(sources.len());
        for path in sources {
            readers.push(RunReader::open(path, inputs_compressed).map_err(map_in)?);
        }

        let mut tree: LoserTree<MergeEntry> = LoserTree::new(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = reader.read_next().map_err(map_in)? {
                tree.set_leaf(source, MergeEntry { record, source });
            }
        }
        tree.build(&mut entry_cmp(&readers));

        let mut writer = RunWriter::create(target, compress_output).map_err(map_out)?;
        let mut merged: u64 = 0;
        while let Some(&entry) = tree.winner_value() {
            let flushed = writer
                .push(entry.record.bytes(readers[entry.source].line()))
                .map_err(map_out)?;
            merged += 1;
            if (flushed || merged & CANCEL_POLL_MASK == 0) && self.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }

            match readers[entry.source].read_next().map_err(map_in)? {
                Some(record) => tree.replace_winner(
                    MergeEntry {
                        record,
                        source: entry.source,
                    },
                    &mut entry_cmp(&readers),
                ),
                None => tree.deactivate_winner(&mut entry_cmp(&readers)),
            }
        }

        writer.finish().map_err(map_out)?;
        Ok(())
    }
}

/// Compares two head records through their owning readers' buffers.
fn entry_cmp(readers: &[RunReader]) -> impl FnMut(&MergeEntry, &MergeEntry) -> Ordering + '_ {
    move |a, b| {
        record::compare(
            &a.record,
            readers[a.source].line(),
            &b.record,
            readers[b.source].line(),
        )
    }
}

fn lock<T>(mutex: &Mutex<Option<T>>) -> std::sync::MutexGuard<'_, Option<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Total merge operations the observer will see: one per intermediate
/// batch plus the final pass.
fn plan_total_merges(mut runs: usize, width: usize) -> u64 {
    let mut total = 1u64;
    while runs > width {
        let batches = (runs + width - 1) / width;
        total += batches as u64;
        runs = batches;
    }
    total
}
