mod cli;
mod command;
mod error;
mod extract;
mod model;
mod orchestrator;
mod relay;
mod runner;
#[cfg(feature = "tui")]
mod tui;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Respects RUST_LOG; defaults to info for this crate.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("yue_panel=info"))
}

fn log_file_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .map(|d| d.join("yue-panel").join("yue-panel.log"))
}

/// Headless runs log to stderr. The TUI owns the terminal, so it logs to a file.
fn init_tracing(headless: bool) -> Result<()> {
    if headless {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter())
            .init();
        return Ok(());
    }

    let Some(path) = log_file_path() else {
        // Nowhere to write; stay silent rather than draw over the UI.
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .with(env_filter())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_headless = args.headless || cfg!(not(feature = "tui"));
    init_tracing(is_headless)?;

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success in headless mode
            if is_headless {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("exiting with error: {e:#}");
            Err(e)
        }
    }
}
