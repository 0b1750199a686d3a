//! Per-file read offsets.
//!
//! Two stores implement [`PositionStore`]: [`MemoryPositions`] for ephemeral
//! runs and tests, and [`JsonFilePositions`] which flushes the mapping to a
//! JSON file in the background so a restart resumes where it left off.

mod file;
mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::Result;

pub use file::JsonFilePositions;
pub use memory::MemoryPositions;

/// Absolute file path to last checkpointed byte offset.
pub type Positions = HashMap<PathBuf, u64>;

/// Checkpoint storage shared by every tailer.
///
/// All methods take `&self`; implementations serialize access internally.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Short name of the backend, used in logs.
    fn name(&self) -> &'static str;

    /// Returns the stored offset for `path`, or `0` if there is none.
    fn get(&self, path: &Path) -> u64;

    fn put(&self, path: &Path, offset: u64) -> Result<()>;

    /// Returns a copy of every entry.
    fn get_all(&self) -> Positions;

    /// Swaps the whole mapping for `positions`.
    fn replace(&self, positions: Positions);

    fn remove(&self, path: &Path);

    /// Flushes and shuts down any background work. Returns once the final
    /// flush attempt has finished.
    async fn stop(&self);
}

/// The mutex-guarded map both stores are built on.
#[derive(Debug, Default)]
pub(crate) struct PositionMap {
    inner: Mutex<Positions>,
}

impl PositionMap {
    pub(crate) fn new(positions: Positions) -> Self {
        PositionMap {
            inner: Mutex::new(positions),
        }
    }

    // A panic while holding the lock cannot leave a plain map half-updated.
    fn lock(&self) -> MutexGuard<'_, Positions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn get(&self, path: &Path) -> u64 {
        self.lock().get(path).copied().unwrap_or(0)
    }

    pub(crate) fn put(&self, path: &Path, offset: u64) {
        self.lock().insert(path.to_path_buf(), offset);
    }

    pub(crate) fn snapshot(&self) -> Positions {
        self.lock().clone()
    }

    pub(crate) fn replace(&self, positions: Positions) {
        *self.lock() = positions;
    }

    pub(crate) fn remove(&self, path: &Path) -> Option<u64> {
        self.lock().remove(path)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
