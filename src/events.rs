//! Everything related to watching directories for file creations.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs;
use tokio::sync::mpsc;

use crate::Result;

/// Receiving end of the filesystem event stream.
pub(crate) type EventStream = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Registers directories for filesystem notifications.
///
/// Registration is non-recursive: only entries directly inside a watched
/// directory produce events.
pub(crate) trait DirWatcher: Send {
    fn watch(&mut self, dir: &Path) -> Result<()>;
    fn unwatch(&mut self, dir: &Path) -> Result<()>;
}

/// [`DirWatcher`] backed by the platform's recommended `notify` watcher.
/// Dropping it closes the event stream.
pub(crate) struct NotifyWatcher {
    inner: RecommendedWatcher,
}

impl NotifyWatcher {
    pub(crate) fn new() -> Result<(Self, EventStream)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Fails only once the receiver is gone.
            let _ = tx.send(res);
        })?;

        Ok((NotifyWatcher { inner }, rx))
    }
}

impl DirWatcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<()> {
        self.inner.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unwatch(&mut self, dir: &Path) -> Result<()> {
        self.inner.unwatch(dir)?;
        Ok(())
    }
}

/// A path that an event reports as newly created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Created {
    File(PathBuf),
    Dir(PathBuf),
}

/// Extracts paths that `event` reports as newly present: creations, and
/// the destination of a rename. Every other kind of event yields nothing.
pub(crate) async fn created(event: Event) -> Vec<Created> {
    let paths = match event.kind {
        EventKind::Create(CreateKind::File) => {
            return event.paths.into_iter().map(Created::File).collect()
        }
        EventKind::Create(CreateKind::Folder) => {
            return event.paths.into_iter().map(Created::Dir).collect()
        }
        EventKind::Create(_) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).collect()
        }
        // Some backends (kqueue, FSEvents) do not say which end of a rename a
        // path is; only the one that exists now can be the destination.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event.paths,
        _ => return Vec::new(),
    };

    let mut created = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => created.push(Created::Dir(path)),
            Ok(_) => created.push(Created::File(path)),
            Err(e) => {
                tracing::trace!(path = %path.display(), error = %e, "created path already gone")
            }
        }
    }
    created
}
