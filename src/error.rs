//! Crate-wide error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(#[from] glob::PatternError),

    #[error("Filesystem watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Path is a directory: {}", .0.display())]
    IsDirectory(PathBuf),

    #[error("Follower for {} has stopped", .0.display())]
    FollowerClosed(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
