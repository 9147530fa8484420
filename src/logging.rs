use anyhow::{Context, Result};
use std::{fs, path::Path, sync::Mutex};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "POKERFACE_LOG";

/// Sends log output to `path` (appending). `POKERFACE_LOG` overrides the
/// default level.
pub fn init(path: &Path, verbose: bool) -> Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|err| anyhow::anyhow!("install log subscriber: {err}"))
}
