//! Keeping the set of tailed files in sync with a glob.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::diff::{diff, SetDiff};
use crate::events::{self, Created, DirWatcher, EventStream, NotifyWatcher};
use crate::handler::LineHandler;
use crate::pattern::GlobPattern;
use crate::position::PositionStore;
use crate::tailer::{Tailer, TailerConfig};
use crate::ticker::{ensure_nonzero, ticker};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Glob selecting the files to tail. `**` matches any number of
    /// directories.
    pub path: String,
    /// How often the glob is re-resolved, and how often each tailer
    /// checkpoints its offset.
    pub sync_interval: Duration,
    /// How often each tailed file is checked for new data.
    pub poll_interval: Duration,
}

impl ManagerConfig {
    pub fn new(path: impl Into<String>) -> Self {
        let defaults = TailerConfig::default();
        ManagerConfig {
            path: path.into(),
            sync_interval: defaults.checkpoint_interval,
            poll_interval: defaults.poll_interval,
        }
    }
}

/// Tails every file matching a glob.
///
/// On construction, and then every `sync_interval`, the glob is resolved and
/// compared against what is being tailed: newly matching files get a
/// [`Tailer`], files that stopped matching have theirs stopped. The parent
/// directory of every matching file is watched, so that a matching file
/// created between two passes is picked up as soon as its creation is
/// reported.
///
/// ```no_run
/// use std::sync::Arc;
/// use globtail::{Manager, ManagerConfig, MemoryPositions, StdoutHandler};
///
/// # async fn run() -> globtail::Result<()> {
/// let manager = Manager::new(
///     ManagerConfig::new("/var/log/**/*.log"),
///     Arc::new(StdoutHandler),
///     Arc::new(MemoryPositions::new()),
/// )
/// .await?;
///
/// // ... later
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Manager {
    pattern: String,
    guard: DropGuard,
    worker: JoinHandle<()>,
}

impl Manager {
    /// Validates the glob, starts the filesystem watcher and runs the first
    /// reconciliation pass before returning.
    pub async fn new(
        config: ManagerConfig,
        handler: Arc<dyn LineHandler>,
        positions: Arc<dyn PositionStore>,
    ) -> Result<Manager> {
        let sync_interval = ensure_nonzero(config.sync_interval, "syncInterval")?;
        let poll_interval = ensure_nonzero(config.poll_interval, "pollInterval")?;
        let glob = GlobPattern::new(&config.path)?;
        let (watcher, events) = NotifyWatcher::new()?;

        tracing::info!(
            pattern = %glob,
            positions = positions.name(),
            "starting tailing manager"
        );

        let pattern = glob.as_str().to_string();
        let mut state = State::new(
            glob,
            Box::new(watcher),
            handler,
            positions,
            TailerConfig {
                checkpoint_interval: sync_interval,
                poll_interval,
            },
        );
        state.sync().await;

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(state, events, sync_interval, cancel.clone()));

        Ok(Manager {
            pattern,
            guard: cancel.drop_guard(),
            worker,
        })
    }

    /// The absolute glob being tailed.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Closes the filesystem watcher, stops every tailer (each saving its
    /// final offset), and waits for all of it to finish.
    pub async fn stop(self) {
        self.guard.disarm().cancel();

        if let Err(e) = self.worker.await {
            tracing::error!(error = %e, "tailing manager task failed");
        }
    }
}

async fn run(
    mut state: State,
    mut events: EventStream,
    sync_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(sync_interval);
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => state.sync().await,
            event = events.recv(), if events_open => match event {
                Some(Ok(event)) => state.handle_event(event).await,
                Some(Err(e)) => tracing::error!(error = %e, "error from fs watcher"),
                None => {
                    tracing::warn!("fs watcher closed, relying on periodic sync only");
                    events_open = false;
                }
            },
        }
    }

    state.shutdown().await;
}

/// Everything the manager task owns.
struct State {
    glob: GlobPattern,
    watcher: Box<dyn DirWatcher>,
    /// Directories registered with `watcher`.
    watches: HashSet<PathBuf>,
    tails: HashMap<PathBuf, Tailer>,
    handler: Arc<dyn LineHandler>,
    positions: Arc<dyn PositionStore>,
    tailer_config: TailerConfig,
}

impl State {
    fn new(
        glob: GlobPattern,
        watcher: Box<dyn DirWatcher>,
        handler: Arc<dyn LineHandler>,
        positions: Arc<dyn PositionStore>,
        tailer_config: TailerConfig,
    ) -> Self {
        State {
            glob,
            watcher,
            watches: HashSet::new(),
            tails: HashMap::new(),
            handler,
            positions,
            tailer_config,
        }
    }

    /// One reconciliation pass.
    async fn sync(&mut self) {
        let glob = self.glob.clone();
        let matches = match tokio::task::spawn_blocking(move || glob.expand()).await {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(pattern = %self.glob, error = %e, "glob expansion task failed");
                return;
            }
        };
        if matches.is_empty() {
            tracing::info!(
                pattern = %self.glob,
                "no files matched requested path, nothing will be tailed"
            );
        }

        let dirs: HashSet<PathBuf> = matches
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        self.sync_watches(dirs);

        let SetDiff { added, removed } = diff(self.tails.keys(), &matches);
        for path in added {
            self.start_tail(path).await;
        }
        self.stop_tailing(removed).await;
    }

    fn sync_watches(&mut self, dirs: HashSet<PathBuf>) {
        let SetDiff { added, removed } = diff(&self.watches, &dirs);

        for dir in removed {
            tracing::debug!(directory = %dir.display(), "removing directory from watcher");
            if let Err(e) = self.watcher.unwatch(&dir) {
                tracing::warn!(directory = %dir.display(), error = %e, "failed to remove directory from watcher");
            }
            self.watches.remove(&dir);
        }
        for dir in added {
            self.watch(dir);
        }
    }

    /// Registers `dir`; a failed registration is left out of `watches` so the
    /// next pass retries it.
    fn watch(&mut self, dir: PathBuf) {
        tracing::debug!(directory = %dir.display(), "watching new directory");
        match self.watcher.watch(&dir) {
            Ok(()) => {
                self.watches.insert(dir);
            }
            Err(e) => {
                tracing::error!(directory = %dir.display(), error = %e, "error adding directory to watcher");
            }
        }
    }

    async fn handle_event(&mut self, event: notify::Event) {
        let mut new_dirs = false;

        for created in events::created(event).await {
            match created {
                Created::File(path) => {
                    if !self.glob.matches(&path) {
                        tracing::trace!(path = %path.display(), "new file does not match glob");
                        continue;
                    }
                    self.start_created(path).await;
                }
                Created::Dir(_) => new_dirs = true,
            }
        }

        if new_dirs && self.glob.is_recursive() {
            self.sync().await;
        }
    }

    /// Starts a file reported by the watcher and makes sure its directory
    /// stays watched.
    async fn start_created(&mut self, path: PathBuf) {
        self.start_tail(path.clone()).await;

        if self.tails.contains_key(&path) {
            if let Some(dir) = path.parent() {
                if !self.watches.contains(dir) {
                    self.watch(dir.to_path_buf());
                }
            }
        }
    }

    async fn start_tail(&mut self, path: PathBuf) {
        if self.tails.contains_key(&path) {
            return;
        }

        tracing::debug!(path = %path.display(), "tailing new file");
        let started = Tailer::start(
            path.clone(),
            self.handler.clone(),
            self.positions.clone(),
            self.tailer_config,
        )
        .await;

        match started {
            Ok(tailer) => {
                self.tails.insert(path, tailer);
            }
            Err(Error::IsDirectory(_)) => {
                tracing::error!(path = %path.display(), "failed to tail file, file is a directory");
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to start tailer");
            }
        }
    }

    async fn stop_tailing(&mut self, paths: Vec<PathBuf>) {
        let stopping = paths.iter().filter_map(|path| {
            tracing::debug!(path = %path.display(), "stopping tailer");
            self.tails.remove(path).map(Tailer::stop)
        });
        join_all(stopping).await;

        // A file recreated at the same path must not resume at the old offset.
        for path in &paths {
            if let Err(e) = tokio::fs::metadata(path).await {
                if e.kind() == io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), "file removed, dropping its position");
                    self.positions.remove(path);
                }
            }
        }
    }

    async fn shutdown(self) {
        let State { watcher, tails, .. } = self;
        drop(watcher);

        join_all(tails.into_values().map(Tailer::stop)).await;
        tracing::debug!("tailing manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::position::MemoryPositions;
    use chrono::{DateTime, Utc};
    use notify::event::{ModifyKind, RenameMode};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Watch(PathBuf),
        Unwatch(PathBuf),
    }

    #[derive(Clone, Default)]
    struct FakeWatcher {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl FakeWatcher {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DirWatcher for FakeWatcher {
        fn watch(&mut self, dir: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Watch(dir.to_path_buf()));
            Ok(())
        }

        fn unwatch(&mut self, dir: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Unwatch(dir.to_path_buf()));
            Ok(())
        }
    }

    fn discard(_: &Path, _: DateTime<Utc>, _: &str) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    fn state(pattern: &str) -> (State, FakeWatcher) {
        let watcher = FakeWatcher::default();
        let state = State::new(
            GlobPattern::new(pattern).unwrap(),
            Box::new(watcher.clone()),
            Arc::new(discard),
            Arc::new(MemoryPositions::new()),
            TailerConfig {
                checkpoint_interval: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
            },
        );
        (state, watcher)
    }

    fn tailed(state: &State) -> HashSet<PathBuf> {
        state.tails.keys().cloned().collect()
    }

    fn set(paths: &[PathBuf]) -> HashSet<PathBuf> {
        paths.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("a")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        let files = [
            root.join("a").join("1.log"),
            root.join("a").join("2.log"),
            root.join("b").join("3.log"),
        ];
        for file in &files {
            fs::write(file, "line\n").unwrap();
        }

        let (mut state, watcher) = state(&format!("{}/*/*.log", root.display()));

        state.sync().await;
        assert_eq!(tailed(&state), set(&files));
        assert_eq!(state.watches, set(&[root.join("a"), root.join("b")]));
        let calls = watcher.calls();
        assert_eq!(calls.len(), 2);

        state.sync().await;
        assert_eq!(tailed(&state), set(&files));
        assert_eq!(state.watches, set(&[root.join("a"), root.join("b")]));
        assert_eq!(watcher.calls(), calls);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_follows_matches() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("a")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        let keep = root.join("a").join("keep.log");
        let gone = root.join("b").join("gone.log");
        fs::write(&keep, "").unwrap();
        fs::write(&gone, "").unwrap();

        let (mut state, watcher) = state(&format!("{}/*/*.log", root.display()));
        state.sync().await;
        assert_eq!(tailed(&state), set(&[keep.clone(), gone.clone()]));

        fs::remove_file(&gone).unwrap();
        let added = root.join("a").join("added.log");
        fs::write(&added, "").unwrap();
        state.sync().await;

        assert_eq!(tailed(&state), set(&[keep, added]));
        assert_eq!(state.watches, set(&[root.join("a")]));
        assert!(watcher.calls().contains(&Call::Unwatch(root.join("b"))));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_recursive_pattern() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("x").join("y")).unwrap();
        let top = root.join("top.log");
        let deep = root.join("x").join("y").join("deep.log");
        fs::write(&top, "").unwrap();
        fs::write(&deep, "").unwrap();
        fs::write(root.join("x").join("skip.txt"), "").unwrap();

        let (mut state, _watcher) = state(&format!("{}/**/*.log", root.display()));
        state.sync().await;

        assert_eq!(tailed(&state), set(&[top, deep]));
        assert_eq!(
            state.watches,
            set(&[root.to_path_buf(), root.join("x").join("y")])
        );

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_matching_directory_is_not_tailed() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("dir.log")).unwrap();
        let file = root.join("file.log");
        fs::write(&file, "").unwrap();

        let (mut state, _watcher) = state(&format!("{}/*.log", root.display()));
        state.sync().await;

        assert_eq!(tailed(&state), set(&[file]));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_matches_is_not_an_error() {
        let tmp = tempdir().unwrap();
        let (mut state, watcher) = state(&format!("{}/*.log", tmp.path().display()));

        state.sync().await;
        assert!(state.tails.is_empty());
        assert!(state.watches.is_empty());
        assert!(watcher.calls().is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_event_starts_matching_file() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        let (mut state, watcher) = state(&format!("{}/*.log", root.display()));
        state.sync().await;

        let matching = root.join("new.log");
        let other = root.join("new.txt");
        fs::write(&matching, "").unwrap();
        fs::write(&other, "").unwrap();

        let event = notify::Event::new(notify::EventKind::Create(notify::event::CreateKind::File))
            .add_path(matching.clone())
            .add_path(other);
        state.handle_event(event).await;

        assert_eq!(tailed(&state), set(&[matching.clone()]));
        assert_eq!(state.watches, set(&[root.to_path_buf()]));
        assert_eq!(watcher.calls(), vec![Call::Watch(root.to_path_buf())]);

        // Already tailed: nothing changes.
        let again = notify::Event::new(notify::EventKind::Create(notify::event::CreateKind::File))
            .add_path(matching.clone());
        state.handle_event(again).await;
        assert_eq!(tailed(&state), set(&[matching]));
        assert_eq!(watcher.calls().len(), 1);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_rename_into_directory_starts_matching_file() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        let staging = root.join("staging");
        fs::create_dir(&staging).unwrap();
        let (mut state, _watcher) = state(&format!("{}/*.log", root.display()));
        state.sync().await;
        assert!(tailed(&state).is_empty());

        fs::write(staging.join("x.tmp"), "moved\n").unwrap();
        let moved = root.join("moved.log");
        fs::rename(staging.join("x.tmp"), &moved).unwrap();

        let event = notify::Event::new(notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(moved.clone());
        state.handle_event(event).await;

        assert_eq!(tailed(&state), set(&[moved]));
        assert_eq!(state.watches, set(&[root.to_path_buf()]));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_directory_triggers_sync_for_recursive_pattern() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        let (mut state, _watcher) = state(&format!("{}/**/*.log", root.display()));
        state.sync().await;

        let nested = root.join("nested");
        fs::create_dir(&nested).unwrap();
        let file = nested.join("app.log");
        fs::write(&file, "").unwrap();

        let event = notify::Event::new(notify::EventKind::Create(notify::event::CreateKind::Folder))
            .add_path(nested.clone());
        state.handle_event(event).await;

        assert_eq!(tailed(&state), set(&[file]));
        assert_eq!(state.watches, set(&[nested]));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_checkpoints_every_tailer() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        let a = root.join("a.log");
        let b = root.join("b.log");
        fs::write(&a, "one\n").unwrap();
        fs::write(&b, "one\ntwo\n").unwrap();

        let positions = Arc::new(MemoryPositions::new());
        let mut state = State::new(
            GlobPattern::new(&format!("{}/*.log", root.display())).unwrap(),
            Box::new(FakeWatcher::default()),
            Arc::new(discard),
            positions.clone(),
            TailerConfig {
                checkpoint_interval: Duration::from_secs(3600),
                poll_interval: Duration::from_millis(10),
            },
        );
        state.sync().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.shutdown().await;

        assert_eq!(positions.get(&a), 4);
        assert_eq!(positions.get(&b), 8);
    }
}
