//! Following a single file as it grows, gets truncated, or is replaced.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{Error, Result};

const READ_CHUNK_SIZE: usize = 64 * 1024;
const LINE_BUFFER: usize = 1024;

/// A complete line read from a followed file.
#[derive(Debug)]
pub struct Line {
    /// Line contents without the trailing `\n` (or `\r\n`).
    pub text: String,
    /// Byte offset just past this line's terminator.
    pub offset: u64,
    /// When the line was read.
    pub time: DateTime<Utc>,
    /// Set when the raw bytes were not valid UTF-8; `text` then holds a lossy
    /// decoding.
    pub error: Option<io::Error>,
}

/// What the reader task sends to its [`Follower`].
#[derive(Debug)]
enum Message {
    Line(Line),
    /// Reading restarted at byte 0, after a truncation or of a replacement
    /// file.
    Reset,
}

#[derive(Debug, Clone, Copy)]
pub struct FollowOptions {
    /// Where to start reading.
    pub offset: u64,
    /// How often the file is checked for new data.
    pub poll_interval: Duration,
    /// Keep waiting for the path to reappear when the file is removed. When
    /// `false`, removal ends the follower.
    pub reopen: bool,
}

impl Default for FollowOptions {
    fn default() -> Self {
        FollowOptions {
            offset: 0,
            poll_interval: Duration::from_millis(250),
            reopen: true,
        }
    }
}

/// Follows one file by polling it, yielding lines in file order.
///
/// Only `\n`-terminated lines are yielded; a trailing partial line is held
/// back until its terminator is written. If the file shrinks below the read
/// position it is read again from the start. If the path is removed or
/// replaced, whatever is left in the old file is read first, then the new
/// file from the start.
///
/// `Follower` also implements [`futures::Stream`], yielding the same lines as
/// [`next_line`](Follower::next_line).
///
/// [`futures::Stream`]: https://docs.rs/futures/0.3/futures/stream/trait.Stream.html
#[derive(Debug)]
pub struct Follower {
    path: PathBuf,
    messages: mpsc::Receiver<Message>,
    offset: u64,
    closed: bool,
    _reader: DropGuard,
}

impl Follower {
    /// Opens `path` at `options.offset` and starts polling it.
    pub async fn open(path: impl Into<PathBuf>, options: FollowOptions) -> Result<Self> {
        let path = path.into();

        let mut file = File::open(&path).await?;
        let identity = FileId::of(&file.metadata().await?);
        file.seek(SeekFrom::Start(options.offset)).await?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let cancel = CancellationToken::new();
        let source = Source {
            path: path.clone(),
            file: Some(file),
            identity,
            pos: options.offset,
            pending: Vec::new(),
            reopen: options.reopen,
        };
        tokio::spawn(source.run(tx, options.poll_interval, cancel.clone()));

        Ok(Follower {
            path,
            messages: rx,
            offset: options.offset,
            closed: false,
            _reader: cancel.drop_guard(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next line. Returns `None` once the file can no longer be
    /// followed.
    pub async fn next_line(&mut self) -> Option<Line> {
        loop {
            let message = self.messages.recv().await;
            if let Some(line) = self.observe(message) {
                return line;
            }
        }
    }

    /// Offset just past the last line handed out in the file currently at
    /// the path: the starting offset if none has been yet, `0` once reading
    /// restarted after a truncation or rotation.
    pub fn tell(&self) -> Result<u64> {
        if self.closed {
            return Err(Error::FollowerClosed(self.path.clone()));
        }
        Ok(self.offset)
    }

    /// Same as [`tell`](Self::tell), but still available once the follower
    /// has closed.
    pub fn last_offset(&self) -> u64 {
        self.offset
    }

    /// Applies `message` to the offset; `None` means there is nothing to
    /// hand out yet.
    fn observe(&mut self, message: Option<Message>) -> Option<Option<Line>> {
        match message {
            Some(Message::Reset) => {
                self.offset = 0;
                None
            }
            Some(Message::Line(line)) => {
                self.offset = line.offset;
                Some(Some(line))
            }
            None => {
                self.closed = true;
                Some(None)
            }
        }
    }
}

impl FuturesStream for Follower {
    type Item = Line;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            let message = ready!(self.messages.poll_recv(cx));
            if let Some(line) = self.observe(message) {
                return task::Poll::Ready(line);
            }
        }
    }
}

/// Identifies the file behind a path, so a replacement at the same
/// path can be told apart from the file first opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId(Option<(u64, u64)>);

impl FileId {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        FileId(Some((meta.dev(), meta.ino())))
    }

    #[cfg(not(unix))]
    fn of(_meta: &std::fs::Metadata) -> Self {
        FileId(None)
    }
}

/// What polling found at the followed path.
enum PathState {
    Same { len: u64 },
    Replaced,
    Gone,
}

/// The reading side, owned by the spawned task.
struct Source {
    path: PathBuf,
    file: Option<File>,
    identity: FileId,
    /// Position of the next byte to read from `file`.
    pos: u64,
    /// Bytes read past the last complete line.
    pending: Vec<u8>,
    reopen: bool,
}

impl Source {
    async fn run(mut self, tx: mpsc::Sender<Message>, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.poll().await {
                Ok(Some(messages)) => {
                    for message in messages {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(message) => if sent.is_err() {
                                return;
                            },
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(path = %self.path.display(), "followed file removed, stopping");
                    return;
                }
                Err(e) => {
                    tracing::error!(path = %self.path.display(), error = %e, "reading followed file");
                    return;
                }
            }
        }
    }

    /// One poll cycle. Returns what became available, or `None` if the file
    /// is gone and should not be waited for.
    async fn poll(&mut self) -> io::Result<Option<Vec<Message>>> {
        let mut lines = Vec::new();

        match self.path_state().await {
            PathState::Same { len } => {
                if self.file.is_some() && len < self.pos {
                    tracing::debug!(path = %self.path.display(), len, pos = self.pos, "file truncated, reading from start");
                    self.rewind().await?;
                    lines.push(Message::Reset);
                }
            }
            state => {
                if self.file.is_some() {
                    // Finish off the old file before moving on.
                    self.read_available(&mut lines).await?;
                    self.flush_pending(&mut lines);
                    self.file = None;
                    tracing::debug!(path = %self.path.display(), "file rotated");
                }
                if matches!(state, PathState::Gone) {
                    if !self.reopen {
                        return Ok(if lines.is_empty() { None } else { Some(lines) });
                    }
                } else {
                    match self.reopen().await {
                        Ok(()) => lines.push(Message::Reset),
                        Err(e) => {
                            tracing::warn!(path = %self.path.display(), error = %e, "reopening rotated file")
                        }
                    }
                }
            }
        }

        if self.file.is_some() {
            self.read_available(&mut lines).await?;
        }

        Ok(Some(lines))
    }

    async fn path_state(&mut self) -> PathState {
        match fs::metadata(&self.path).await {
            Ok(meta) if self.file.is_none() || FileId::of(&meta) != self.identity => {
                PathState::Replaced
            }
            Ok(meta) => PathState::Same { len: meta.len() },
            Err(e) if e.kind() == io::ErrorKind::NotFound => PathState::Gone,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "stat followed file");
                PathState::Same { len: self.pos }
            }
        }
    }

    async fn reopen(&mut self) -> io::Result<()> {
        let file = File::open(&self.path).await?;
        self.identity = FileId::of(&file.metadata().await?);
        self.file = Some(file);
        self.pos = 0;
        self.pending.clear();
        Ok(())
    }

    async fn rewind(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(0)).await?;
        }
        self.pos = 0;
        self.pending.clear();
        Ok(())
    }

    /// Reads up to the current end of file, appending complete lines.
    async fn read_available(&mut self, lines: &mut Vec<Message>) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let mut chunk = vec![0; READ_CHUNK_SIZE];
        let read = loop {
            match file.read(&mut chunk).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    self.pos += n as u64;
                    self.pending.extend_from_slice(&chunk[..n]);
                    self.split_lines(lines);
                }
                Err(e) => break Err(e),
            }
        };
        self.file = Some(file);

        read
    }

    fn split_lines(&mut self, lines: &mut Vec<Message>) {
        let base = self.pos - self.pending.len() as u64;
        let mut start = 0;

        while let Some(newline) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + newline;
            lines.push(Message::Line(decode(
                &self.pending[start..end],
                base + end as u64 + 1,
            )));
            start = end + 1;
        }

        self.pending.drain(..start);
    }

    /// Emits an unterminated trailing line; used when the file is rotated
    /// away and will never be completed.
    fn flush_pending(&mut self, lines: &mut Vec<Message>) {
        if !self.pending.is_empty() {
            lines.push(Message::Line(decode(&self.pending, self.pos)));
            self.pending.clear();
        }
    }
}

fn decode(raw: &[u8], offset: u64) -> Line {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let (text, error) = match std::str::from_utf8(raw) {
        Ok(text) => (text.to_string(), None),
        Err(e) => (
            String::from_utf8_lossy(raw).into_owned(),
            Some(io::Error::new(io::ErrorKind::InvalidData, e)),
        ),
    };

    Line {
        text,
        offset,
        time: Utc::now(),
        error,
    }
}
