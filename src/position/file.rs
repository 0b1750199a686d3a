use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{PositionMap, PositionStore, Positions};
use crate::ticker::{ensure_nonzero, ticker};
use crate::{Error, Result};

#[cfg(unix)]
const POSITION_FILE_MODE: u32 = 0o600;

/// Positions backed by a JSON file.
///
/// The file holds a single object mapping absolute paths to byte offsets:
///
/// ```json
/// {"/var/log/app.log": 1024, "/var/log/other.log": 0}
/// ```
///
/// A background task writes the mapping out every `sync_interval` and once
/// more on [`stop`](PositionStore::stop). Each write goes to a temporary file
/// next to the target which is then renamed over it, so readers only ever see
/// a complete snapshot. After each periodic write, entries for files that no
/// longer exist are dropped.
pub struct JsonFilePositions {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    path: PathBuf,
    map: PositionMap,
}

impl JsonFilePositions {
    /// Loads `path` if it exists (an absent file is an empty mapping) and
    /// starts the flush task. Must be called from within a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>, sync_interval: Duration) -> Result<Self> {
        let path = path.into();
        let sync_interval = ensure_nonzero(sync_interval, "syncInterval")?;
        if path.file_name().is_none() {
            return Err(Error::Config(format!(
                "position file {} has no file name",
                path.display()
            )));
        }

        let positions = load(&path).await?;
        tracing::info!(
            path = %path.display(),
            entries = positions.len(),
            "loaded positions"
        );

        let shared = Arc::new(Shared {
            path,
            map: PositionMap::new(positions),
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(shared.clone(), sync_interval, cancel.clone()));

        Ok(JsonFilePositions {
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Writes the current mapping out immediately.
    pub async fn save(&self) -> Result<()> {
        self.shared.save().await
    }

    /// Drops entries whose file no longer exists.
    pub async fn cleanup(&self) {
        self.shared.cleanup().await
    }
}

impl Drop for JsonFilePositions {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl PositionStore for JsonFilePositions {
    fn name(&self) -> &'static str {
        "json_file"
    }

    fn get(&self, path: &Path) -> u64 {
        self.shared.map.get(path)
    }

    fn put(&self, path: &Path, offset: u64) -> Result<()> {
        tracing::trace!(path = %path.display(), offset, "put position");
        self.shared.map.put(path, offset);
        Ok(())
    }

    fn get_all(&self) -> Positions {
        self.shared.map.snapshot()
    }

    fn replace(&self, positions: Positions) {
        self.shared.map.replace(positions);
    }

    fn remove(&self, path: &Path) {
        self.shared.map.remove(path);
    }

    async fn stop(&self) {
        self.cancel.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "position flush task failed");
            }
        }
    }
}

async fn run(shared: Arc<Shared>, sync_interval: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(sync_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.save().await {
                    tracing::error!(path = %shared.path.display(), error = %e, "save positions");
                }
                shared.cleanup().await;
            }
        }
    }

    match shared.save().await {
        Ok(()) => tracing::debug!(path = %shared.path.display(), "saved positions on stop"),
        Err(e) => {
            tracing::error!(path = %shared.path.display(), error = %e, "save positions on stop")
        }
    }
}

impl Shared {
    async fn save(&self) -> Result<()> {
        // Sorted so the file diffs cleanly between snapshots.
        let snapshot: BTreeMap<PathBuf, u64> = self.map.snapshot().into_iter().collect();
        let content = serde_json::to_vec(&snapshot)?;
        atomic_write(&self.path, &content).await
    }

    async fn cleanup(&self) {
        let paths: Vec<PathBuf> = self.map.snapshot().into_keys().collect();

        for path in paths {
            match fs::metadata(&path).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "dropping position of vanished file");
                    self.map.remove(&path);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "could not determine if file still exists, keeping its position"
                    );
                }
            }
        }
        tracing::trace!(entries = self.map.len(), "cleaned positions");
    }
}

async fn load(path: &Path) -> Result<Positions> {
    match fs::read(path).await {
        Ok(content) if content.iter().all(u8::is_ascii_whitespace) => Ok(Positions::new()),
        Ok(content) => Ok(serde_json::from_slice(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
            Ok(Positions::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes `content` to a uniquely named sibling of `path`, then renames it
/// over `path`.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut temp_name = path.file_name().map(OsString::from).unwrap_or_default();
    temp_name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let temp_path = path.with_file_name(temp_name);

    let written = write_new(&temp_path, content).await;
    let renamed = match written {
        Ok(()) => fs::rename(&temp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = renamed {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    Ok(())
}

async fn write_new(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(POSITION_FILE_MODE);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}
