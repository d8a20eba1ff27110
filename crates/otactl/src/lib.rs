//! otactl - drive an otakit state directory from the command line.
//!
//! Each invocation opens the state directory, runs one host operation and
//! exits. Run `startup` first to reconcile the way an app launch would.
//! `watch` keeps polling until interrupted.

pub mod cli;
mod commands;
mod host;
mod output;

use anyhow::{Context, Result};
use otakit::{DirectoryTransport, FileStorage, Updater, UpdaterConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub use cli::{Cli, Commands};
pub use host::CliHost;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "OTAKIT_LOG";

/// Log to stderr so `--json` output on stdout stays parseable
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// State directory chosen by `--root`, else the platform data dir
pub fn state_root(cli: &Cli) -> PathBuf {
    cli.root.clone().unwrap_or_else(FileStorage::default_root)
}

/// Build an updater for this invocation.
///
/// Downloads from anything that is not an http(s) url go through the
/// local-file transport.
pub fn build_updater(cli: &Cli) -> Result<Updater> {
    let config = UpdaterConfig::load(cli.config.as_deref(), &cli.platform)?;
    let root = state_root(cli);
    let storage = Arc::new(FileStorage::new(&root));
    let host = Arc::new(CliHost::new(&cli.native_version, &cli.platform));

    let mut builder = Updater::builder(storage, host).config(config);
    if let Commands::Download { url, .. } = &cli.command {
        if !is_http(url) {
            builder = builder.transport(Arc::new(DirectoryTransport));
        }
    }
    builder
        .build()
        .with_context(|| format!("Failed to open state directory {}", root.display()))
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub async fn run(cli: Cli) -> Result<()> {
    let updater = build_updater(&cli)?;
    commands::execute(&updater, cli.command, output::Printer { json: cli.json }).await
}
