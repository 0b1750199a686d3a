//! Glob-driven, checkpointed tailing for (namely log) files.
//!
//! A [`Manager`] keeps one [`Tailer`] running for every file matching a glob,
//! including recursive `**` globs, starting and stopping tailers as files
//! appear and disappear. Every line read is passed to a [`LineHandler`], and
//! each tailer periodically records how far it has read in a
//! [`PositionStore`], so that a restart resumes where the previous run left
//! off.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use globtail::{Config, Manager, StdoutHandler};
//!
//! #[tokio::main]
//! async fn main() -> globtail::Result<()> {
//!     let mut config = Config::new("/var/log/**/*.log");
//!     config.position_file = Some("/var/lib/globtail/positions.json".into());
//!
//!     let positions = config.open_positions().await?;
//!     let manager = Manager::new(
//!         config.manager_config(),
//!         Arc::new(StdoutHandler),
//!         positions.clone(),
//!     )
//!     .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Tailers save their offsets before the store's final flush.
//!     manager.stop().await;
//!     positions.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Only the parent directories of files that currently match are watched for
//! creations. A matching file appearing in a directory with no other matching
//! file is found by the next periodic pass rather than immediately.

pub mod config;
mod diff;
mod error;
mod events;
pub mod follow;
pub mod handler;
pub mod manager;
mod pattern;
pub mod position;
pub mod tailer;
mod ticker;

pub use config::Config;
pub use diff::{diff, SetDiff};
pub use error::{Error, Result};
pub use follow::{FollowOptions, Follower, Line};
pub use handler::{HandlerError, LineHandler, StdoutHandler};
pub use manager::{Manager, ManagerConfig};
pub use pattern::GlobPattern;
pub use position::{JsonFilePositions, MemoryPositions, PositionStore, Positions};
pub use tailer::{Tailer, TailerConfig};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
