//! CLI - Command-line argument parsing
//!
//! Keeps argument parsing separate from execution, so tests can drive
//! [`Cli::try_parse_from`] without touching any state.

use clap::{Parser, Subcommand};
use otakit::{BundleId, DelayKind, LifecycleEvent};
use std::path::PathBuf;

/// otakit control CLI
#[derive(Debug, Parser)]
#[command(name = "otactl")]
#[command(about = "Drive an otakit state directory from the command line", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// State directory (default: $XDG_DATA_HOME/otakit)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Configuration file (default: ~/.config/otakit/config.toml, /etc/otakit/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Platform whose [platforms.<name>] overrides apply
    #[arg(long, global = true, default_value = "linux")]
    pub platform: String,

    /// Native app version the simulated host reports
    #[arg(long, global = true, default_value = "1.0.0")]
    pub native_version: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reconcile persisted state as a process start would
    Startup,

    /// Signal a lifecycle transition
    Lifecycle {
        #[arg(value_parser = LifecycleEvent::parse)]
        event: LifecycleEvent,
    },

    /// Confirm the current bundle booted correctly
    NotifyAppReady,

    /// Download a bundle from an http(s) url, a local archive or a directory
    Download {
        #[arg(long)]
        url: String,
        #[arg(long)]
        version: String,
        /// Expected SHA-256 of the archive
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Activate a bundle at the next lifecycle checkpoint
    Next { id: BundleId },

    /// Activate a bundle now and reload
    Set { id: BundleId },

    /// Delete a downloaded bundle
    Delete { id: BundleId },

    /// List downloaded bundles
    List,

    /// Return to builtin, or to the last confirmed bundle
    Reset {
        #[arg(long)]
        to_last_successful: bool,
    },

    /// Show the rendered bundle and the native version
    Current,

    /// Reload the current bundle
    Reload,

    /// Postpone promotion of the next bundle until a condition holds
    SetDelay {
        #[arg(value_parser = DelayKind::parse)]
        kind: DelayKind,
        /// Target native version or RFC 3339 date
        value: Option<String>,
    },

    /// Clear the delay directive
    CancelDelay,

    /// Show the delay directive
    GetDelay,

    /// Ask the update server for the latest version and act on it
    GetLatest {
        /// Ignore the delay directive and queue the bundle as next
        #[arg(long)]
        no_delay: bool,
    },

    /// Print the device id
    GetId,

    /// Print the library version
    GetPluginVersion,

    /// Whether background polling would run with this configuration
    IsAutoUpdateEnabled,

    /// Show the activation phase
    Phase,

    /// Run startup, then poll for updates until interrupted
    Watch,
}
