mod browser;
mod cli;
mod config;
mod error;
mod index;
mod logging;
mod metadata;
mod mirror;
mod search;
mod service;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
