//! Temp-file registry for sorted runs.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates uniquely-named paths for sorted runs under one working
/// directory and removes everything when dropped.
///
/// The working directory is a fresh subdirectory of either the caller's
/// base directory or the OS temp directory, so concurrent sorts never
/// collide. Cleanup is best-effort; the registry is never a source of
/// sort failure.
pub struct TempRegistry {
    dir: tempfile::TempDir,
    next_chunk_id: AtomicU64,
}

impl TempRegistry {
    /// Creates the working directory.
    pub fn new(base: Option<&Path>) -> io::Result<TempRegistry> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("lexsort-");
            builder
        };
        let dir = match base {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        log::info!("using {} as a working directory", dir.path().display());

        Ok(TempRegistry {
            dir,
            next_chunk_id: AtomicU64::new(0),
        })
    }

    /// The working directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Allocates a path for one phase-1 sorted chunk.
    pub fn chunk_path(&self) -> PathBuf {
        let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("chunk_{:06}", id))
    }

    /// Allocates a path for one merge-pass output.
    pub fn merge_path(&self, pass: usize, batch: usize) -> PathBuf {
        self.dir.path().join(format!("merge_p{}_i{:06}", pass, batch))
    }

    /// Removes files that a completed merge pass consumed. Best-effort:
    /// a file that cannot be removed is only logged.
    pub fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(err) = std::fs::remove_file(path) {
                log::debug!("could not remove {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::TempRegistry;

    #[test]
    fn test_paths_are_unique_and_named() {
        let registry = TempRegistry::new(None).unwrap();

        let a = registry.chunk_path();
        let b = registry.chunk_path();
        assert_ne!(a, b);
        assert_eq!(a.file_name().unwrap(), "chunk_000000");
        assert_eq!(b.file_name().unwrap(), "chunk_000001");

        let m = registry.merge_path(2, 7);
        assert_eq!(m.file_name().unwrap(), "merge_p2_i000007");
        assert!(m.starts_with(registry.path()));
    }

    #[test]
    fn test_drop_removes_directory_and_files() {
        let registry = TempRegistry::new(None).unwrap();
        let dir = registry.path().to_path_buf();
        fs::write(registry.chunk_path(), b"run data").unwrap();

        drop(registry);
        assert!(!dir.exists());
    }

    #[test]
    fn test_working_dir_under_user_base() {
        let base = tempfile::tempdir().unwrap();
        let registry = TempRegistry::new(Some(base.path())).unwrap();
        assert!(registry.path().starts_with(base.path()));
    }

    #[test]
    fn test_discard_removes_files() {
        let registry = TempRegistry::new(None).unwrap();
        let path = registry.chunk_path();
        fs::write(&path, b"x").unwrap();

        registry.discard(std::slice::from_ref(&path));
        assert!(!path.exists());

        // Missing files are tolerated.
        registry.discard(std::slice::from_ref(&path));
    }
}
