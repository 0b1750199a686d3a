//! Tailing one file into a [`LineHandler`], checkpointing as it goes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::follow::{FollowOptions, Follower, Line};
use crate::handler::LineHandler;
use crate::position::PositionStore;
use crate::ticker::{ensure_nonzero, ticker};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    /// How often the read offset is written to the position store.
    pub checkpoint_interval: Duration,
    /// How often the file is checked for new data.
    pub poll_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        TailerConfig {
            checkpoint_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Owns the background task following one file.
///
/// Reading resumes from the offset recorded in the position store, unless the
/// file is now shorter than that offset, in which case the stale entry is
/// dropped and reading starts from the beginning. The task runs until
/// [`stop`](Tailer::stop) is called or the file can no longer be read, and
/// always records its final offset before finishing.
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    guard: DropGuard,
    worker: JoinHandle<()>,
}

impl Tailer {
    /// Starts tailing `path`, which must exist and not be a directory.
    pub async fn start(
        path: impl Into<PathBuf>,
        handler: Arc<dyn LineHandler>,
        positions: Arc<dyn PositionStore>,
        config: TailerConfig,
    ) -> Result<Tailer> {
        let path = path.into();
        let checkpoint_interval = ensure_nonzero(config.checkpoint_interval, "checkpointInterval")?;
        let poll_interval = ensure_nonzero(config.poll_interval, "pollInterval")?;

        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(Error::IsDirectory(path));
        }

        let mut offset = positions.get(&path);
        if meta.len() < offset {
            tracing::info!(
                path = %path.display(),
                size = meta.len(),
                offset,
                "file is shorter than its checkpoint, reading from start"
            );
            positions.remove(&path);
            offset = 0;
        }

        let follower = Follower::open(
            &path,
            FollowOptions {
                offset,
                poll_interval,
                reopen: true,
            },
        )
        .await?;

        let cancel = CancellationToken::new();
        let worker = Worker {
            path: path.clone(),
            follower,
            handler,
            positions,
        };
        let worker = tokio::spawn(worker.run(checkpoint_interval, cancel.clone()));
        tracing::debug!(path = %path.display(), offset, "started tailer");

        Ok(Tailer {
            path,
            guard: cancel.drop_guard(),
            worker,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the task and waits for its final checkpoint.
    pub async fn stop(self) {
        self.guard.disarm().cancel();

        if let Err(e) = self.worker.await {
            tracing::error!(path = %self.path.display(), error = %e, "tailer task failed");
        }
    }
}

struct Worker {
    path: PathBuf,
    follower: Follower,
    handler: Arc<dyn LineHandler>,
    positions: Arc<dyn PositionStore>,
}

impl Worker {
    async fn run(mut self, checkpoint_interval: Duration, cancel: CancellationToken) {
        let mut ticker = ticker(checkpoint_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.checkpoint(),
                line = self.follower.next_line() => match line {
                    Some(line) => self.deliver(line),
                    None => {
                        tracing::debug!(path = %self.path.display(), "line source closed");
                        break;
                    }
                },
            }
        }

        self.checkpoint();
        tracing::debug!(path = %self.path.display(), "stopped tailer");
    }

    fn deliver(&self, line: Line) {
        if let Some(e) = &line.error {
            tracing::error!(path = %self.path.display(), error = %e, "error reading line");
        }
        if let Err(e) = self.handler.handle(&self.path, line.time, &line.text) {
            tracing::error!(path = %self.path.display(), error = %e, "error handling line");
        }
    }

    fn checkpoint(&self) {
        let offset = match self.follower.tell() {
            Ok(offset) => offset,
            // Lines already handed out still count.
            Err(Error::FollowerClosed(_)) => self.follower.last_offset(),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "get tail position");
                return;
            }
        };
        if let Err(e) = self.positions.put(&self.path, offset) {
            tracing::error!(path = %self.path.display(), error = %e, "save tail position");
        }
    }
}
