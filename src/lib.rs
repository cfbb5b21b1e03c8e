//! `lexsort` is an external merge sort for very large line-oriented text files.
//!
//! Input records have the form `<Number>. <String>` and are ordered
//! byte-lexicographically by the string part, with ties broken by the
//! ascending numeric value. Files many times larger than RAM are handled
//! in two phases: the input is split at line boundaries into chunks that
//! fit in memory, each chunk is sorted on a worker pool and persisted as
//! a sorted run, then the runs are merged through a tournament loser
//! tree, in multiple passes when the run count exceeds the merge width.
//! For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `lexsort` supports the following features:
//!
//! * **Bounded memory:**
//!   the chunk size and the bounded write queue together form a hard cap
//!   on memory use, independent of input size.
//! * **Multithreading support:**
//!   chunks are read and sorted by parallel workers while a small pool
//!   of writer threads persists finished runs behind them.
//! * **Compressed intermediates:**
//!   runs that will be read back by another merge pass are
//!   zstd-compressed to shrink the temporary disk footprint.
//! * **Cooperative cancellation and progress reporting:**
//!   a shared token stops the sort at the next suspension point, and an
//!   observer callback receives per-phase progress events.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use lexsort::{ExternalSorterBuilder, SortProgress};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_chunk_size(256 * 1024 * 1024)
//!         .with_progress(|progress: SortProgress| {
//!             log::debug!("{:?}: {}/{}", progress.phase, progress.current, progress.total);
//!         })
//!         .build()
//!         .unwrap();
//!
//!     sorter.sort(Path::new("input.txt"), Path::new("output.txt")).unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod control;
pub mod loser_tree;
pub mod memory;
pub mod merger;
pub mod quicksort;
pub mod reader;
pub mod record;
pub mod sort;
pub mod temp;

pub use control::{CancelToken, SortPhase, SortProgress};
pub use loser_tree::LoserTree;
pub use record::{compare, ParseError, Record};
pub use sort::{ExternalSorter, ExternalSorterBuilder, FileRange, SortError};
