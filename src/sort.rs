//! External sorter.

use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::buffer::BufferPool;
use crate::chunk;
use crate::control::{CancelToken, ProgressFn, ProgressMeter, SortPhase, SortProgress};
use crate::memory;
use crate::merger::{self, MergeError, Merger};
use crate::record::Record;
use crate::temp::TempRegistry;

/// Bounds for the computed chunk size. The upper bound also caps
/// user-supplied sizes: record descriptors address their chunk with
/// 32-bit offsets.
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Share of available memory the chunking phase may plan with.
const MEMORY_USAGE_RATIO: f64 = 0.6;

/// Read granularity when probing range boundaries for a newline.
const BOUNDARY_PROBE_SIZE: usize = 64 * 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Input file cannot be opened or read.
    Input(io::Error),
    /// Output file cannot be created or written.
    Output(io::Error),
    /// Working directory cannot be created or written.
    TempDir(io::Error),
    /// A compressed intermediate stream failed to encode or decode.
    Codec(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuild(rayon::ThreadPoolBuildError),
    /// The buffer pool could not satisfy a request.
    ResourceExhausted,
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SortError::Input(err)
            | SortError::Output(err)
            | SortError::TempDir(err)
            | SortError::Codec(err) => Some(err),
            SortError::ThreadPoolBuild(err) => Some(err),
            SortError::ResourceExhausted | SortError::Cancelled => None,
        }
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::Input(err) => write!(f, "input file not readable: {}", err),
            SortError::Output(err) => write!(f, "output file not writable: {}", err),
            SortError::TempDir(err) => write!(f, "working directory not usable: {}", err),
            SortError::Codec(err) => write!(f, "intermediate compression failed: {}", err),
            SortError::ThreadPoolBuild(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::ResourceExhausted => write!(f, "buffer pool exhausted"),
            SortError::Cancelled => write!(f, "sort cancelled"),
        }
    }
}

impl From<MergeError> for SortError {
    fn from(err: MergeError) -> SortError {
        match err {
            MergeError::Run(err) => SortError::TempDir(err),
            MergeError::Codec(err) => SortError::Codec(err),
            MergeError::Target(err) => SortError::Output(err),
            MergeError::Cancelled => SortError::Cancelled,
        }
    }
}

/// A byte range of the input whose cuts land immediately after `\n`
/// (except at end of file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRange {
    pub start: u64,
    pub end: u64,
}

impl FileRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`]
/// initialization.
#[derive(Clone, Default)]
pub struct ExternalSorterBuilder {
    chunk_size: Option<u64>,
    parallel: Option<usize>,
    tmp_dir: Option<PathBuf>,
    merge_width: Option<usize>,
    progress: Option<Arc<ProgressFn>>,
    cancel: CancelToken,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        let parallel = self.parallel.unwrap_or_else(|| {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        let pool = init_thread_pool(parallel)?;
        let merge_width = match self.merge_width {
            Some(width) => width.max(2),
            None => merger::derive_merge_width(parallel),
        };

        return Ok(ExternalSorter {
            pool,
            parallel,
            merge_width,
            chunk_size: self.chunk_size,
            tmp_dir: self.tmp_dir,
            progress: self.progress,
            cancel: self.cancel,
        });
    }

    /// Sets the raw chunk size in bytes; computed from available memory
    /// when unset.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> ExternalSorterBuilder {
        self.chunk_size = Some(chunk_size);
        return self;
    }

    /// Sets the number of workers used to read and sort chunks in
    /// parallel; defaults to the host's logical CPU count.
    pub fn with_parallel_degree(mut self, parallel: usize) -> ExternalSorterBuilder {
        self.parallel = Some(parallel);
        return self;
    }

    /// Sets the directory the working directory is created under.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets how many runs one merge combines; derived from the parallel
    /// degree when unset.
    pub fn with_merge_width(mut self, width: usize) -> ExternalSorterBuilder {
        self.merge_width = Some(width);
        return self;
    }

    /// Sets the progress observer.
    pub fn with_progress<F>(mut self, observer: F) -> ExternalSorterBuilder
    where
        F: Fn(SortProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(observer));
        return self;
    }

    /// Sets the cancellation token checked at suspension points.
    pub fn with_cancellation(mut self, cancel: CancelToken) -> ExternalSorterBuilder {
        self.cancel = cancel;
        return self;
    }
}

/// External sorter for `<Number>. <String>` line files.
///
/// One instance sorts one file at a time: chunks are sorted on a worker
/// pool and persisted through a bounded write queue, then merged back
/// into the target through a loser tree.
pub struct ExternalSorter {
    pool: rayon::ThreadPool,
    parallel: usize,
    merge_width: usize,
    chunk_size: Option<u64>,
    tmp_dir: Option<PathBuf>,
    progress: Option<Arc<ProgressFn>>,
    cancel: CancelToken,
}

impl ExternalSorter {
    /// Sorts `input` into `output`.
    ///
    /// The output is written from scratch; on error or cancellation a
    /// partially written output is left as-is, while temp state is
    /// disposed either way.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<(), SortError> {
        let input_len = fs::metadata(input).map_err(SortError::Input)?.len();
        self.check_cancelled()?;

        if input_len == 0 {
            File::create(output).map_err(SortError::Output)?;
            self.emit_done(0);
            return Ok(());
        }

        let chunk_size = match self.chunk_size {
            Some(size) => size.clamp(1, MAX_CHUNK_SIZE),
            None => default_chunk_size(self.parallel),
        };
        let ranges = plan_ranges(input, input_len, chunk_size).map_err(SortError::Input)?;
        log::info!(
            "sorting {} ({} bytes, {} ranges, chunk size {})",
            input.display(),
            input_len,
            ranges.len(),
            chunk_size
        );

        let registry = TempRegistry::new(self.tmp_dir.as_deref()).map_err(SortError::TempDir)?;

        // Phase-1 runs are only worth compressing when another pass will
        // read them back; the single-pass case streams them straight
        // into the uncompressed target.
        let multi_pass = ranges.len() > self.merge_width;
        let chunks = self.run_chunking(input, input_len, &ranges, &registry, multi_pass)?;
        self.check_cancelled()?;

        log::debug!("chunking done: {} sorted runs", chunks.len());
        let merger = Merger::new(
            &registry,
            &self.pool,
            self.merge_width,
            usize::max(1, self.parallel / 2),
            &self.cancel,
            self.progress.as_deref(),
        );
        merger.merge(chunks, multi_pass, output)?;

        self.emit_done(input_len);
        log::debug!("external sort finished");
        return Ok(());
    }

    /// Runs the chunking phase: range workers read and sort on the
    /// thread pool, write jobs cross a bounded queue to a small pool of
    /// writer threads. The queue bound provides backpressure, so sort
    /// CPU runs ahead of chunk I/O by at most the queue capacity.
    fn run_chunking(
        &self,
        input: &Path,
        input_len: u64,
        ranges: &[FileRange],
        registry: &TempRegistry,
        compress: bool,
    ) -> Result<Vec<PathBuf>, SortError> {
        let queue_capacity = usize::max(2, self.parallel / 2);
        let writer_count = (self.parallel / 4).clamp(1, 4);
        let buffers = BufferPool::new(self.parallel + queue_capacity + writer_count);
        let meter = ProgressMeter::new(self.progress.as_deref(), SortPhase::Chunking, input_len);
        let chunk_paths: Mutex<Vec<PathBuf>> = Mutex::new(Vec::with_capacity(ranges.len()));
        let failure: Mutex<Option<SortError>> = Mutex::new(None);
        let stop = AtomicBool::new(false);

        let (tx, rx) = crossbeam_channel::bounded::<WriteJob>(queue_capacity);

        thread::scope(|threads| {
            for _ in 0..writer_count {
                let rx = rx.clone();
                let buffers = &buffers;
                let chunk_paths = &chunk_paths;
                let failure = &failure;
                let stop = &stop;
                let cancel = &self.cancel;
                threads.spawn(move || {
                    for job in rx {
                        if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                            // Keep draining so blocked senders can exit.
                            buffers.give_back(job.buf);
                            continue;
                        }
                        let result =
                            chunk::write_chunk(&job.buf, &job.records, &job.path, job.compress, cancel);
                        buffers.give_back(job.buf);
                        // A run joins the merge set only once its write
                        // finished; a cancelled or failed write leaves
                        // an unusable file behind.
                        match result {
                            Ok(()) => lock(chunk_paths).push(job.path),
                            Err(chunk::WriteError::Cancelled) => {
                                fail(failure, stop, SortError::Cancelled);
                            }
                            Err(chunk::WriteError::Io(err)) => {
                                let kind = if job.compress {
                                    SortError::Codec(err)
                                } else {
                                    SortError::TempDir(err)
                                };
                                fail(failure, stop, kind);
                            }
                        }
                    }
                });
            }
            drop(rx);

            self.pool.scope(|tasks| {
                for &range in ranges {
                    let tx = tx.clone();
                    let buffers = &buffers;
                    let meter = &meter;
                    let failure = &failure;
                    let stop = &stop;
                    tasks.spawn(move |_| {
                        if stop.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                            return;
                        }
                        let Some(mut buf) = buffers.rent(range.len() as usize) else {
                            fail(failure, stop, SortError::ResourceExhausted);
                            return;
                        };
                        if let Err(err) = read_range(input, range, &mut buf) {
                            buffers.give_back(buf);
                            fail(failure, stop, SortError::Input(err));
                            return;
                        }
                        if self.cancel.is_cancelled() {
                            buffers.give_back(buf);
                            return;
                        }

                        let records = chunk::sort_chunk(&buf);
                        let job = WriteJob {
                            records,
                            buf,
                            path: registry.chunk_path(),
                            compress,
                        };
                        if let Err(err) = tx.send(job) {
                            // Channel can only close after a failure.
                            buffers.give_back(err.into_inner().buf);
                            return;
                        }
                        meter.advance(range.len());
                    });
                }
            });
            drop(tx);
        });

        if let Some(err) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        self.check_cancelled()?;
        return Ok(chunk_paths.into_inner().unwrap_or_else(PoisonError::into_inner));
    }

    fn check_cancelled(&self) -> Result<(), SortError> {
        if self.cancel.is_cancelled() {
            Err(SortError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn emit_done(&self, total: u64) {
        if let Some(progress) = self.progress.as_deref() {
            progress(SortProgress {
                phase: SortPhase::Done,
                current: total,
                total,
            });
        }
    }
}

/// One pending chunk write crossing the bounded queue. Buffer ownership
/// travels with the job and returns to the pool at the writer.
struct WriteJob {
    records: Vec<Record>,
    buf: Vec<u8>,
    path: PathBuf,
    compress: bool,
}

fn init_thread_pool(parallel: usize) -> Result<rayon::ThreadPool, SortError> {
    log::info!("initializing thread-pool (threads: {})", parallel);
    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel)
        .build()
        .map_err(SortError::ThreadPoolBuild)?;

    return Ok(thread_pool);
}

fn default_chunk_size(parallel: usize) -> u64 {
    let available = memory::available_memory();
    let target = (available as f64 * MEMORY_USAGE_RATIO) as u64 / parallel.max(1) as u64;
    let chunk_size = target.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    log::debug!(
        "chunk size {} derived from {} available bytes across {} workers",
        chunk_size,
        available,
        parallel
    );
    chunk_size
}

/// Splits `[0, len)` into ranges of roughly `chunk_size` bytes whose
/// boundaries land immediately after a newline. Consecutive probes that
/// find the same newline collapse into one range.
fn plan_ranges(input: &Path, len: u64, chunk_size: u64) -> io::Result<Vec<FileRange>> {
    let count = (len + chunk_size - 1) / chunk_size;
    let mut file = File::open(input)?;
    let mut probe = vec![0u8; BOUNDARY_PROBE_SIZE];

    let mut boundaries = Vec::with_capacity(count as usize + 1);
    boundaries.push(0u64);
    for i in 1..count {
        let boundary = probe_newline(&mut file, i * chunk_size, len, &mut probe)?;
        let prev = boundaries[boundaries.len() - 1];
        boundaries.push(boundary.max(prev));
    }
    boundaries.push(len);

    let ranges = boundaries
        .windows(2)
        .map(|pair| FileRange {
            start: pair[0],
            end: pair[1],
        })
        .filter(|range| !range.is_empty())
        .collect();
    Ok(ranges)
}

/// Finds the first byte position after a newline at or past `candidate`,
/// extending the probe forward until a newline or end of file.
fn probe_newline(file: &mut File, candidate: u64, len: u64, probe: &mut [u8]) -> io::Result<u64> {
    let mut offset = candidate;
    file.seek(SeekFrom::Start(offset))?;
    while offset < len {
        let want = probe.len().min((len - offset) as usize);
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut probe[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if let Some(pos) = memchr::memchr(b'\n', &probe[..filled]) {
            return Ok(offset + pos as u64 + 1);
        }
        offset += filled as u64;
    }
    Ok(len)
}

fn read_range(input: &Path, range: FileRange, buf: &mut [u8]) -> io::Result<()> {
    let mut file = File::open(input)?;
    file.seek(SeekFrom::Start(range.start))?;
    file.read_exact(buf)
}

fn fail(failure: &Mutex<Option<SortError>>, stop: &AtomicBool, err: SortError) {
    let mut slot = lock(failure);
    if slot.is_none() {
        *slot = Some(err);
    }
    stop.store(true, Ordering::Relaxed);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
