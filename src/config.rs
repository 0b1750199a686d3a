//! Settings for a tailing session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::manager::ManagerConfig;
use crate::position::{JsonFilePositions, MemoryPositions, PositionStore};
use crate::ticker::ensure_nonzero;
use crate::{Error, Result};

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration as read from a TOML file:
///
/// ```toml
/// path = "/var/log/**/*.log"
/// positionFile = "/var/lib/globtail/positions.json"
/// syncInterval = "10s"
/// ```
///
/// Intervals are either integer milliseconds or a `humantime` duration such
/// as `500ms`, `10s` or `1m 30s`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Glob selecting the files to tail.
    pub path: String,
    /// Where offsets are persisted. Offsets are kept in memory only when
    /// unset.
    #[serde(default)]
    pub position_file: Option<PathBuf>,
    /// Period of glob reconciliation, offset checkpoints and position file
    /// flushes.
    #[serde(
        default = "default_sync_interval",
        alias = "checkpointInterval",
        deserialize_with = "deserialize_duration"
    )]
    pub sync_interval: Duration,
    /// How often each tailed file is checked for new data.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
}

impl Config {
    pub fn new(path: impl Into<String>) -> Self {
        Config {
            path: path.into(),
            position_file: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::Config("path must not be empty".to_string()));
        }
        ensure_nonzero(self.sync_interval, "syncInterval")?;
        ensure_nonzero(self.poll_interval, "pollInterval")?;
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            path: self.path.clone(),
            sync_interval: self.sync_interval,
            poll_interval: self.poll_interval,
        }
    }

    /// Opens the position store this configuration asks for: file-backed if
    /// `positionFile` is set, in-memory otherwise.
    pub async fn open_positions(&self) -> Result<Arc<dyn PositionStore>> {
        let positions: Arc<dyn PositionStore> = match &self.position_file {
            Some(path) => Arc::new(JsonFilePositions::open(path, self.sync_interval).await?),
            None => Arc::new(MemoryPositions::new()),
        };
        Ok(positions)
    }
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Millis(millis) => Ok(Duration::from_millis(millis)),
        RawDuration::Text(text) => parse_duration(&text).map_err(de::Error::custom),
    }
}

/// Bare digits are milliseconds; anything else goes through `humantime`
/// (`500ms`, `10s`, `1m 30s`, `2h`).
fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid duration {:?}: {}", text, e));
    }
    humantime::parse_duration(text).map_err(|e| format!("invalid duration {:?}: {}", text, e))
}
