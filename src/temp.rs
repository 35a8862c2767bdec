//! Session-scoped scratch space.
//!
//! Operation backups, staged downloads and atomic-write intermediates all
//! live under one root that is removed when the run's [`Context`] drops.
//! Names are handed out from a counter, so a backup path is stable for as
//! long as the session lives, which is exactly the lifetime rollback needs.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context as _, Result};
use tracing::{debug, warn};

pub struct Context {
    root: PathBuf,
    next: AtomicU64,
    keep_on_drop: AtomicBool,
}

impl Context {
    /// Create the scratch root under `parent` (normally the directory named
    /// by `TMPDIR`, falling back to the system temp dir).
    pub fn new(parent: &Path, prefix: &str) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)
            .with_context(|| format!("could not create temp root in '{}'", parent.display()))?
            .keep();
        debug!("scratch root at {}", root.display());
        Ok(Self {
            root,
            next: AtomicU64::new(0),
            keep_on_drop: AtomicBool::new(false),
        })
    }

    pub fn in_system_temp(prefix: &str) -> Result<Self> {
        Self::new(&std::env::temp_dir(), prefix)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a fresh file path. The file is not created; the caller moves
    /// or writes the backup into place.
    pub fn new_file(&self) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!("backup-{n}"))
    }

    /// Create and return a fresh subdirectory.
    pub fn new_directory(&self) -> Result<PathBuf> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let dir = self.root.join(format!("dir-{n}"));
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create temp directory '{}'", dir.display()))?;
        Ok(dir)
    }

    /// Leave the scratch tree on disk when the context drops. Used after an
    /// aborted run so a post-mortem can inspect the backups.
    pub fn keep(&self) {
        self.keep_on_drop.store(true, Ordering::Relaxed);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.keep_on_drop.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = remove_dir_all::remove_dir_all(&self.root) {
            warn!("could not clean scratch root {}: {e}", self.root.display());
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("temp::Context")
            .field("root", &self.root)
            .finish()
    }
}
