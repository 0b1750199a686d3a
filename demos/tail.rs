//! Tails files matching a glob, printing every line to stdout.
//!
//! Usage:
//!     tail <config.toml>
//!     tail '<glob>' [position file]
//!
//! Runs until interrupted with ctrl-c, then saves offsets and exits.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use globtail::{Config, Manager, StdoutHandler};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("globtail=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.as_slice() {
        [path] if path.ends_with(".toml") => Config::load(path).await?,
        [pattern] => Config::new(pattern.as_str()),
        [pattern, position_file] => {
            let mut config = Config::new(pattern.as_str());
            config.position_file = Some(position_file.into());
            config
        }
        _ => return Err("usage: tail <config.toml> | tail <glob> [position file]".into()),
    };
    config.validate()?;

    let positions = config.open_positions().await?;
    let manager = Manager::new(
        config.manager_config(),
        Arc::new(StdoutHandler),
        positions.clone(),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    manager.stop().await;
    positions.stop().await;

    Ok(())
}
