#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use globtail::{HandlerError, LineHandler};
use tokio::time::{sleep, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Handler recording every line it is given.
#[derive(Default)]
pub struct Collector {
    lines: Mutex<Vec<(PathBuf, String)>>,
}

impl Collector {
    pub fn lines(&self) -> Vec<(PathBuf, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines().into_iter().map(|(_, text)| text).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    /// Waits until at least `n` lines have been collected.
    pub async fn wait_for(&self, n: usize) {
        let deadline = Instant::now() + TIMEOUT;
        while self.len() < n {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} lines, got {:?}",
                n,
                self.texts()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl LineHandler for Collector {
    fn handle(&self, path: &Path, _time: DateTime<Utc>, text: &str) -> Result<(), HandlerError> {
        self.lines
            .lock()
            .unwrap()
            .push((path.to_path_buf(), text.to_string()));
        Ok(())
    }
}

pub fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.sync_all().unwrap();
}

/// `count` lines of the form `line <n>`, starting at `first`.
pub fn numbered(first: usize, count: usize) -> Vec<String> {
    (first..first + count).map(|n| format!("line {}", n)).collect()
}

pub fn append_lines(path: &Path, lines: &[String]) {
    let mut content = lines.join("\n");
    content.push('\n');
    append(path, &content);
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}
