//! Download Manager - one in-flight transfer per `(url, version)`.
//!
//! The first caller for a version becomes the leader and runs the transfer.
//! Later callers with the same url wait on the leader's watch channel and
//! get a clone of its result. A caller asking for the same version from a
//! different url is refused with `DownloadInProgress`.
//!
//! If the leader's future is dropped mid-transfer, its [`Flight`] guard marks
//! the bundle `error`, removes the partial files and wakes the waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bundle::{Bundle, BundleId, BundleStatus};
use crate::config::UpdaterConfig;
use crate::error::{OtaError, OtaResult};
use crate::events::{EventEmitter, UpdaterEvent};
use crate::registry::BundleRegistry;
use crate::stats::{StatsAction, StatsReporter};
use crate::transport::{FetchRequest, Transport};

type Outcome = Option<OtaResult<Bundle>>;

struct InFlight {
    url: String,
    rx: watch::Receiver<Outcome>,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

#[derive(Clone)]
pub struct DownloadManager {
    registry: BundleRegistry,
    transport: Arc<dyn Transport>,
    events: EventEmitter,
    stats: StatsReporter,
    config: Arc<UpdaterConfig>,
    in_flight: InFlightMap,
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

impl DownloadManager {
    pub fn new(
        registry: BundleRegistry,
        transport: Arc<dyn Transport>,
        events: EventEmitter,
        stats: StatsReporter,
        config: Arc<UpdaterConfig>,
    ) -> Self {
        Self {
            registry,
            transport,
            events,
            stats,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Versions with a transfer currently running
    pub fn in_flight(&self) -> Vec<String> {
        let mut versions: Vec<String> = lock_map(&self.in_flight).keys().cloned().collect();
        versions.sort();
        versions
    }

    pub fn is_in_flight(&self, version: &str) -> bool {
        lock_map(&self.in_flight).contains_key(version)
    }

    /// Download and register a bundle, or join the transfer already running for it
    pub async fn download(&self, request: FetchRequest) -> OtaResult<Bundle> {
        if request.url.trim().is_empty() {
            return Err(OtaError::InvalidArgument("Download url must not be empty".into()));
        }
        if request.version.trim().is_empty() {
            return Err(OtaError::InvalidArgument(
                "Download version must not be empty".into(),
            ));
        }

        let role = {
            let mut map = lock_map(&self.in_flight);
            match map.get(&request.version) {
                Some(flight) if flight.url == request.url => Role::Follower(flight.rx.clone()),
                Some(flight) => {
                    debug!(
                        "Refusing {} from {}: already downloading from {}",
                        request.version, request.url, flight.url
                    );
                    return Err(OtaError::DownloadInProgress(request.version.clone()));
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(
                        request.version.clone(),
                        InFlight {
                            url: request.url.clone(),
                            rx,
                        },
                    );
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(rx) => {
                debug!("Joining in-flight download of {}", request.version);
                wait_for_leader(rx, &request.version).await
            }
            Role::Leader(tx) => {
                let mut flight = Flight {
                    map: self.in_flight.clone(),
                    version: request.version.clone(),
                    tx: Some(tx),
                    bundle_id: None,
                    registry: self.registry.clone(),
                };
                let result = self.run(&request, &mut flight).await;
                flight.finish(result.clone());
                result
            }
        }
    }

    async fn run(&self, request: &FetchRequest, flight: &mut Flight) -> OtaResult<Bundle> {
        if let Some(existing) = self.registry.find_by_version(&request.version) {
            let complete = existing.status == BundleStatus::Success
                && self
                    .registry
                    .storage()
                    .has_entry_file(&existing.id, &self.config.entry_file);
            if complete {
                debug!("Version {} already downloaded as {}", existing.version, existing.id);
                return Ok(existing);
            }
            info!(
                "Replacing stale {} bundle {} for version {}",
                existing.status, existing.id, existing.version
            );
            self.registry.delete(&existing.id)?;
        }

        let bundle = self.registry.create(&request.version)?;
        flight.bundle_id = Some(bundle.id.clone());
        let bundle = self.registry.set_status(&bundle.id, BundleStatus::Downloading)?;

        let dest = self.registry.storage().bundle_dir(&bundle.id);
        self.registry.storage().remove_bundle_files(&bundle.id)?;

        let last_percent: Mutex<Option<u8>> = Mutex::new(None);
        let events = self.events.clone();
        let progress_bundle = bundle.clone();
        let progress = move |percent: u8| {
            let percent = percent.min(100);
            let mut last = last_percent.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*last, Some(seen) if percent <= seen) {
                return;
            }
            *last = Some(percent);
            drop(last);
            events.emit(UpdaterEvent::Download {
                percent,
                bundle: progress_bundle.clone(),
            });
        };

        let fetched = self.transport.fetch(request, &dest, &progress).await;
        let fetched = fetched.and_then(|outcome| {
            if self
                .registry
                .storage()
                .has_entry_file(&bundle.id, &self.config.entry_file)
            {
                Ok(outcome)
            } else {
                Err(OtaError::invalid_bundle(
                    bundle.id.as_str(),
                    format!("archive has no {}", self.config.entry_file),
                ))
            }
        });

        match fetched {
            Ok(outcome) => {
                let bundle = self.registry.mark_success(&bundle.id, outcome.checksum)?;
                info!("Downloaded {} as bundle {}", bundle.version, bundle.id);
                self.events.emit(UpdaterEvent::DownloadComplete {
                    bundle: bundle.clone(),
                });
                self.stats
                    .record(StatsAction::DownloadComplete, &bundle.version, None);
                Ok(bundle)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", request.version, e);
                fail_bundle(&self.registry, &bundle.id, self.config.auto_delete_failed);
                self.events.emit(UpdaterEvent::DownloadFailed {
                    version: request.version.clone(),
                });
                self.stats
                    .record(StatsAction::DownloadFail, &request.version, None);
                Err(e)
            }
        }
    }
}

async fn wait_for_leader(mut rx: watch::Receiver<Outcome>, version: &str) -> OtaResult<Bundle> {
    let cancelled = || OtaError::NetworkError(format!("Download of {} was cancelled", version));
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(cancelled())),
        Err(_) => Err(cancelled()),
    }
}

/// Mark a bundle failed and get rid of its files
fn fail_bundle(registry: &BundleRegistry, id: &BundleId, delete: bool) {
    if let Err(e) = registry.set_status(id, BundleStatus::Error) {
        warn!("Could not mark {} as error: {}", id, e);
    }
    let cleanup = if delete {
        registry.delete(id)
    } else {
        registry.storage().remove_bundle_files(id)
    };
    if let Err(e) = cleanup {
        warn!("Cleanup of failed bundle {} incomplete: {}", id, e);
    }
}

/// Leader-side guard for one in-flight entry
struct Flight {
    map: InFlightMap,
    version: String,
    tx: Option<watch::Sender<Outcome>>,
    bundle_id: Option<BundleId>,
    registry: BundleRegistry,
}

impl Flight {
    fn finish(&mut self, result: OtaResult<Bundle>) {
        lock_map(&self.map).remove(&self.version);
        if let Some(tx) = self.tx.take() {
            // Nobody waiting is fine
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }

        warn!("Download of {} cancelled", self.version);
        if let Some(id) = &self.bundle_id {
            fail_bundle(&self.registry, id, false);
        }
        let error = OtaError::NetworkError(format!("Download of {} was cancelled", self.version));
        self.finish(Err(error));
    }
}

fn lock_map(map: &InFlightMap) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}
