//! What happens to a line once it has been read.

use std::error::Error as StdError;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

/// Error returned by a [`LineHandler`]. Opaque to the tailing core, which only
/// logs it.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Receives every line read by every tailer.
///
/// Implementations are shared between all running tailers, so `handle` may be
/// called concurrently for different files. Calls for the same file are
/// always sequential and in file order.
pub trait LineHandler: Send + Sync {
    fn handle(&self, path: &Path, time: DateTime<Utc>, text: &str) -> Result<(), HandlerError>;
}

impl<F> LineHandler for F
where
    F: Fn(&Path, DateTime<Utc>, &str) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, path: &Path, time: DateTime<Utc>, text: &str) -> Result<(), HandlerError> {
        self(path, time, text)
    }
}

/// Writes each line to stdout as `filename=<path> time=<rfc3339> text=<line>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutHandler;

impl LineHandler for StdoutHandler {
    fn handle(&self, path: &Path, time: DateTime<Utc>, text: &str) -> Result<(), HandlerError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", format_line(path, time, text))?;
        Ok(())
    }
}

fn format_line(path: &Path, time: DateTime<Utc>, text: &str) -> String {
    format!(
        "filename={} time={} text={}",
        path.display(),
        time.to_rfc3339_opts(SecondsFormat::Millis, true),
        text
    )
}
