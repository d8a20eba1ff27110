//! Command execution

use anyhow::{Context, Result};
use otakit::{CheckOutcome, FetchRequest, Updater};
use serde_json::json;
use tracing::info;

use crate::cli::Commands;
use crate::output::{bundle_line, bundle_table, Printer};

pub async fn execute(updater: &Updater, command: Commands, out: Printer) -> Result<()> {
    match command {
        Commands::Startup => {
            let report = updater.startup()?;
            out.emit(&report, |r| {
                let current = r.current.as_ref().map(bundle_line).unwrap_or_default();
                format!(
                    "current: {}\nstale downloads: {}, orphans removed: {}, repaired: {}",
                    current,
                    r.stale_downloads.len(),
                    r.orphans_removed.len(),
                    r.pointers_repaired.len()
                )
            })
        }

        Commands::Lifecycle { event } => {
            let promoted = updater.on_lifecycle(event)?;
            out.emit(&promoted, |p| match p {
                Some(bundle) => format!("Activated {}", bundle_line(bundle)),
                None => "Nothing to activate".to_string(),
            })
        }

        Commands::NotifyAppReady => {
            let bundle = updater.notify_app_ready()?;
            out.emit(&bundle, |b| format!("Confirmed {}", bundle_line(b)))
        }

        Commands::Download {
            url,
            version,
            checksum,
        } => {
            info!("Downloading {} from {}", version, url);
            let bundle = updater
                .download(FetchRequest {
                    url,
                    version,
                    checksum,
                })
                .await?;
            out.emit(&bundle, |b| bundle_line(b))
        }

        Commands::Next { id } => {
            let bundle = updater.next(&id)?;
            out.emit(&bundle, |b| format!("Next: {}", bundle_line(b)))
        }

        Commands::Set { id } => {
            updater.set(&id)?;
            out.ok(&format!("Activated {}", id))
        }

        Commands::Delete { id } => {
            updater.delete(&id)?;
            out.ok(&format!("Deleted {}", id))
        }

        Commands::List => {
            let bundles = updater.list();
            out.emit(&bundles, |b| bundle_table(b))
        }

        Commands::Reset { to_last_successful } => {
            updater.reset(to_last_successful)?;
            let current = updater.current();
            out.emit(&current, |c| format!("Reset to {}", bundle_line(&c.bundle)))
        }

        Commands::Current => {
            let current = updater.current();
            out.emit(&current, |c| {
                format!("bundle: {}\nnative: {}", bundle_line(&c.bundle), c.native)
            })
        }

        Commands::Reload => {
            updater.reload()?;
            out.ok("Reloaded")
        }

        Commands::SetDelay { kind, value } => {
            updater.set_delay(kind, value)?;
            let delay = updater.get_delay();
            out.emit(&delay, |_| format!("Delay set: {}", kind))
        }

        Commands::CancelDelay => {
            updater.cancel_delay()?;
            out.ok("Delay cancelled")
        }

        Commands::GetDelay => {
            let delay = updater.get_delay();
            out.emit(&delay, |d| match d {
                Some(d) => format!("{} {}", d.kind, d.value.as_deref().unwrap_or("")),
                None => "No delay".to_string(),
            })
        }

        Commands::GetLatest { no_delay } => {
            let latest = updater.get_latest(!no_delay).await?;
            out.emit(&latest, |l| {
                let action = match &l.outcome {
                    CheckOutcome::UpToDate => "up to date".to_string(),
                    CheckOutcome::MajorAvailable => "major update available".to_string(),
                    CheckOutcome::Queued { bundle } => format!("queued as next ({})", bundle.id),
                    CheckOutcome::Staged { bundle } => {
                        format!("staged until the delay is satisfied ({})", bundle.id)
                    }
                };
                format!("latest: {} - {}", l.version, action)
            })
        }

        Commands::GetId => {
            let id = updater.get_id();
            out.emit(&json!({ "id": id }), |_| id.to_string())
        }

        Commands::GetPluginVersion => {
            let version = updater.get_plugin_version();
            out.emit(&json!({ "version": version }), |_| version.to_string())
        }

        Commands::IsAutoUpdateEnabled => {
            let enabled = updater.is_auto_update_enabled();
            out.emit(&json!({ "enabled": enabled }), |_| enabled.to_string())
        }

        Commands::Phase => {
            let phase = updater.phase();
            out.emit(&phase, |p| format!("{:?}", p))
        }

        Commands::Watch => {
            updater.startup()?;
            let Some(poller) = updater.start_auto_update() else {
                anyhow::bail!("Auto-update is disabled; set autoUpdate = true and updateUrl");
            };
            info!("Watching for updates, Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            poller.abort();
            info!("Stopped");
            Ok(())
        }
    }
}
