//! Startup reconciliation - repair whatever the last process left behind.
//!
//! Runs once per process start, before the host renders anything:
//!
//! 1. native version change (with `resetWhenUpdate`) drops all downloads
//! 2. transfers stuck in `pending`/`downloading` past the grace period fail
//! 3. bundle directories with no registry entry are removed
//! 4. pointers to unusable bundles are reset or cleared
//! 5. an expired readiness record is rolled back
//! 6. `next` is promoted if its delay allows

use serde::Serialize;
use std::fs;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::activation::ActivationController;
use crate::bundle::{Bundle, BundleId, BundleStatus};
use crate::clock::Clock;
use crate::config::UpdaterConfig;
use crate::delay::LifecycleEvent;
use crate::download::DownloadManager;
use crate::error::OtaResult;
use crate::host::HostBridge;
use crate::readiness::ReadinessMonitor;
use crate::registry::BundleRegistry;
use crate::state::{PersistedState, StateStore};
use crate::storage::Storage;

/// What one startup pass changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub native_reset: bool,
    pub stale_downloads: Vec<BundleId>,
    pub orphans_removed: Vec<BundleId>,
    pub pointers_repaired: Vec<String>,
    pub rolled_back: Option<BundleId>,
    pub promoted: Option<Bundle>,
    pub current: Option<Bundle>,
}

pub struct Reconciler<'a> {
    pub store: &'a Arc<StateStore>,
    pub registry: &'a BundleRegistry,
    pub activation: &'a ActivationController,
    pub readiness: &'a ReadinessMonitor,
    pub downloads: &'a DownloadManager,
    pub host: &'a dyn HostBridge,
    pub clock: &'a dyn Clock,
    pub config: &'a UpdaterConfig,
}

impl Reconciler<'_> {
    pub fn run(&self) -> OtaResult<ReconcileReport> {
        let mut report = ReconcileReport {
            native_reset: self.check_native_version()?,
            ..ReconcileReport::default()
        };
        report.stale_downloads = self.sweep_stale_downloads();
        report.orphans_removed = self.sweep_orphans();
        report.pointers_repaired = self.validate_pointers()?;

        if let Some(record) = self.readiness.expired() {
            self.activation.rollback(&record)?;
            report.rolled_back = Some(record.bundle_id);
        }

        report.promoted = self
            .activation
            .promote_next_if_due(LifecycleEvent::ProcessStart)?;
        report.current = Some(self.activation.current());

        info!(
            "Startup reconciliation done: current {}, {} stale, {} orphans, {} repaired",
            report.current.as_ref().map(|b| b.id.to_string()).unwrap_or_default(),
            report.stale_downloads.len(),
            report.orphans_removed.len(),
            report.pointers_repaired.len()
        );
        Ok(report)
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.store.storage()
    }

    /// Returns true when a native update wiped the downloaded bundles
    fn check_native_version(&self) -> OtaResult<bool> {
        let native = self.host.native_version();
        let removed: Vec<BundleId> = {
            let mut state = self.store.lock();
            let last = state.last_native_version.clone();
            if last.as_deref() == Some(native.as_str()) {
                return Ok(false);
            }

            let reset = self.config.reset_when_update && last.is_some();
            let removed = if reset {
                info!(
                    "Native version changed {} -> {}, dropping downloaded bundles",
                    last.as_deref().unwrap_or("?"),
                    native
                );
                let ids: Vec<BundleId> = state.bundles.keys().cloned().collect();
                state.bundles.clear();
                state.current = BundleId::builtin();
                state.next = None;
                state.staged = None;
                state.known_good.clear();
                state.readiness = None;
                ids
            } else {
                Vec::new()
            };

            state.last_native_version = Some(native);
            state.commit()?;
            if !reset {
                return Ok(false);
            }
            removed
        };

        for id in &removed {
            if let Err(e) = self.storage().remove_bundle_files(id) {
                warn!("Files of {} left behind, orphan sweep will retry: {}", id, e);
            }
        }
        Ok(true)
    }

    fn sweep_stale_downloads(&self) -> Vec<BundleId> {
        let cutoff = self.clock.now() - self.config.stale_download_age();
        let stale: Vec<Bundle> = self
            .registry
            .list()
            .into_iter()
            .filter(|b| matches!(b.status, BundleStatus::Pending | BundleStatus::Downloading))
            .filter(|b| b.downloaded <= cutoff && !self.downloads.is_in_flight(&b.version))
            .collect();

        let mut swept = Vec::new();
        for bundle in stale {
            warn!(
                "Bundle {} ({}) stuck in {} since {}, marking failed",
                bundle.id,
                bundle.version,
                bundle.status,
                bundle.downloaded.to_rfc3339()
            );
            if let Err(e) = self.registry.set_status(&bundle.id, BundleStatus::Error) {
                warn!("Could not mark {} as error: {}", bundle.id, e);
                continue;
            }
            let cleanup = if self.config.auto_delete_failed {
                self.registry.delete(&bundle.id)
            } else {
                self.storage().remove_bundle_files(&bundle.id)
            };
            if let Err(e) = cleanup {
                warn!("Cleanup of stale bundle {} incomplete: {}", bundle.id, e);
            }
            swept.push(bundle.id);
        }
        swept
    }

    fn sweep_orphans(&self) -> Vec<BundleId> {
        let on_disk = match self.storage().list_bundle_dirs() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not list bundle directories: {}", e);
                return Vec::new();
            }
        };

        let known = self.store.snapshot().bundles;
        let mut removed = Vec::new();
        for id in on_disk.into_iter().filter(|id| !known.contains_key(id)) {
            match self.storage().remove_bundle_files(&id) {
                Ok(()) => {
                    debug!("Removed orphan bundle directory {}", id);
                    removed.push(id);
                }
                Err(e) => warn!("Failed to remove orphan {}: {}", id, e),
            }
        }

        if self.downloads.in_flight().is_empty() {
            let scratch = self.storage().download_dir();
            match fs::remove_dir_all(&scratch) {
                Ok(()) => debug!("Cleared download scratch {}", scratch.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to clear {}: {}", scratch.display(), e),
            }
        }
        removed
    }

    fn validate_pointers(&self) -> OtaResult<Vec<String>> {
        let storage = self.storage().clone();
        let entry_file = &self.config.entry_file;
        let usable = |state: &PersistedState, id: &BundleId| -> bool {
            id.is_builtin()
                || state.bundles.get(id).is_some_and(|b| {
                    b.status == BundleStatus::Success && storage.has_entry_file(id, entry_file)
                })
        };

        let mut repaired = Vec::new();
        let mut state = self.store.lock();

        if !usable(&*state, &state.current) {
            warn!("Current bundle {} is unusable, falling back to builtin", state.current);
            let current = state.current.clone();
            mark_broken(&mut state, &current);
            state.current = BundleId::builtin();
            repaired.push(format!("current {}", current));
        }
        if let Some(next) = state.next.clone().filter(|id| !usable(&*state, id)) {
            warn!("Next bundle {} is unusable, clearing", next);
            mark_broken(&mut state, &next);
            state.next = None;
            repaired.push(format!("next {}", next));
        }
        if let Some(staged) = state.staged.clone().filter(|id| !usable(&*state, id)) {
            warn!("Staged bundle {} is unusable, clearing", staged);
            mark_broken(&mut state, &staged);
            state.staged = None;
            repaired.push(format!("staged {}", staged));
        }
        let stale_record = state
            .readiness
            .as_ref()
            .is_some_and(|record| record.bundle_id != state.current);
        if stale_record {
            debug!("Dropping readiness record for a bundle that is no longer current");
            state.readiness = None;
            repaired.push("readiness".to_string());
        }

        if repaired.is_empty() {
            return Ok(repaired);
        }
        state.commit()?;
        Ok(repaired)
    }
}

/// A `success` bundle that failed validation is not coming back
fn mark_broken(state: &mut PersistedState, id: &BundleId) {
    if let Some(bundle) = state.bundles.get_mut(id) {
        if bundle.status == BundleStatus::Success {
            bundle.status = BundleStatus::Error;
        }
    }
}
