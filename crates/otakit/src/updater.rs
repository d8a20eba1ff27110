//! Updater - the host-facing surface, wiring every component together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activation::{ActivationController, ActivationDeps, ActivationPhase};
use crate::bundle::{Bundle, BundleId};
use crate::clock::{Clock, SystemClock};
use crate::config::UpdaterConfig;
use crate::delay::{DelayDirective, DelayKind, DelayScheduler, LifecycleEvent};
use crate::download::DownloadManager;
use crate::error::{OtaError, OtaResult};
use crate::events::{EventEmitter, EventKind, ListenerHandle, UpdaterEvent};
use crate::host::HostBridge;
use crate::identity;
use crate::poller::{AutoUpdatePoller, HttpUpdateSource, LatestVersion, UpdateSource, INITIAL_DELAY};
use crate::readiness::ReadinessMonitor;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::BundleRegistry;
use crate::state::StateStore;
use crate::stats::{StatsAction, StatsReporter};
use crate::storage::Storage;
use crate::transport::{FetchRequest, HttpTransport, Transport};
use crate::PLUGIN_VERSION;

/// Result of `current()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentBundle {
    pub bundle: Bundle,
    pub native: String,
}

/// Assembles an [`Updater`]; anything not supplied gets the production default
pub struct UpdaterBuilder {
    storage: Arc<dyn Storage>,
    host: Arc<dyn HostBridge>,
    config: UpdaterConfig,
    transport: Option<Arc<dyn Transport>>,
    source: Option<Arc<dyn UpdateSource>>,
    clock: Option<Arc<dyn Clock>>,
    stats: Option<StatsReporter>,
}

impl UpdaterBuilder {
    pub fn config(mut self, config: UpdaterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn update_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn stats(mut self, stats: StatsReporter) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> OtaResult<Updater> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = Arc::new(StateStore::open(self.storage.clone()));
        let device_id = identity::ensure_device_id(&store)?;
        let platform = self.host.platform();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                config.request_timeout(),
                self.storage.download_dir(),
            )?),
        };
        let source: Option<Arc<dyn UpdateSource>> = match (self.source, &config.update_url) {
            (Some(source), _) => Some(source),
            (None, Some(url)) => Some(Arc::new(HttpUpdateSource::new(
                url.clone(),
                config.request_timeout(),
            )?)),
            (None, None) => None,
        };

        let mut stats_task = None;
        let stats = match (self.stats, &config.stats_url) {
            (Some(stats), _) => stats,
            (None, Some(url)) if tokio::runtime::Handle::try_current().is_ok() => {
                let (stats, task) = StatsReporter::spawn(
                    url,
                    config.request_timeout(),
                    device_id.clone(),
                    platform.clone(),
                    config.app_id.clone(),
                )?;
                stats_task = Some(task);
                stats
            }
            (None, Some(_)) => {
                warn!("statsUrl set but no async runtime is running, stats disabled");
                StatsReporter::disabled()
            }
            (None, None) => StatsReporter::disabled(),
        };

        let events = EventEmitter::new();
        let registry = BundleRegistry::new(store.clone(), clock.clone());
        let readiness = ReadinessMonitor::new(store.clone(), clock.clone());
        let delay = DelayScheduler::new(store.clone(), clock.clone());
        let activation = Arc::new(ActivationController::new(ActivationDeps {
            store: store.clone(),
            registry: registry.clone(),
            readiness: readiness.clone(),
            host: self.host.clone(),
            events: events.clone(),
            stats: stats.clone(),
            clock: clock.clone(),
            config: config.clone(),
        }));
        let downloads = DownloadManager::new(
            registry.clone(),
            transport,
            events.clone(),
            stats.clone(),
            config.clone(),
        );
        let poller = source.map(|source| {
            Arc::new(AutoUpdatePoller::new(
                source,
                downloads.clone(),
                activation.clone(),
                store.clone(),
                self.host.clone(),
                events.clone(),
                config.clone(),
            ))
        });

        debug!("Updater ready for device {} on {}", device_id, platform);
        Ok(Updater {
            store,
            registry,
            activation,
            readiness,
            delay,
            downloads,
            poller,
            events,
            stats,
            host: self.host,
            clock,
            config,
            device_id,
            _stats_task: stats_task,
        })
    }
}

/// OTA bundle manager for one app install
pub struct Updater {
    store: Arc<StateStore>,
    registry: BundleRegistry,
    activation: Arc<ActivationController>,
    readiness: ReadinessMonitor,
    delay: DelayScheduler,
    downloads: DownloadManager,
    poller: Option<Arc<AutoUpdatePoller>>,
    events: EventEmitter,
    stats: StatsReporter,
    host: Arc<dyn HostBridge>,
    clock: Arc<dyn Clock>,
    config: Arc<UpdaterConfig>,
    device_id: String,
    _stats_task: Option<JoinHandle<()>>,
}

impl Updater {
    pub fn builder(storage: Arc<dyn Storage>, host: Arc<dyn HostBridge>) -> UpdaterBuilder {
        UpdaterBuilder {
            storage,
            host,
            config: UpdaterConfig::default(),
            transport: None,
            source: None,
            clock: None,
            stats: None,
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Reconcile persisted state at process start; call before rendering
    pub fn startup(&self) -> OtaResult<ReconcileReport> {
        Reconciler {
            store: &self.store,
            registry: &self.registry,
            activation: &self.activation,
            readiness: &self.readiness,
            downloads: &self.downloads,
            host: self.host.as_ref(),
            clock: self.clock.as_ref(),
            config: &self.config,
        }
        .run()
    }

    /// Lifecycle checkpoint: roll back an overdue activation, else try promoting next
    pub fn on_lifecycle(&self, event: LifecycleEvent) -> OtaResult<Option<Bundle>> {
        if let Some(record) = self.readiness.expired() {
            return self.activation.rollback(&record).map(Some);
        }
        self.activation.promote_next_if_due(event)
    }

    /// Start background polling when `autoUpdate` is on and a server is configured
    pub fn start_auto_update(&self) -> Option<JoinHandle<()>> {
        if !self.config.auto_update {
            return None;
        }
        let Some(poller) = &self.poller else {
            warn!("autoUpdate enabled without updateUrl, not polling");
            return None;
        };
        Some(poller.clone().spawn(self.config.check_interval(), INITIAL_DELAY))
    }

    pub fn notify_app_ready(&self) -> OtaResult<Bundle> {
        self.activation.confirm_ready()
    }

    pub async fn download(&self, request: FetchRequest) -> OtaResult<Bundle> {
        self.downloads.download(request).await
    }

    pub fn next(&self, id: &BundleId) -> OtaResult<Bundle> {
        self.activation.set_next(id)
    }

    pub fn set(&self, id: &BundleId) -> OtaResult<()> {
        self.activation.set_current_and_reload(id).map(|_| ())
    }

    pub fn delete(&self, id: &BundleId) -> OtaResult<()> {
        let version = self.registry.get(id).map(|b| b.version).ok();
        self.registry.delete(id)?;
        if let Some(version) = version {
            self.stats.record(StatsAction::Delete, &version, None);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Bundle> {
        self.registry.list()
    }

    pub fn reset(&self, to_last_successful: bool) -> OtaResult<()> {
        self.activation.reset(to_last_successful).map(|_| ())
    }

    pub fn current(&self) -> CurrentBundle {
        CurrentBundle {
            bundle: self.activation.current(),
            native: self.host.native_version(),
        }
    }

    pub fn reload(&self) -> OtaResult<()> {
        self.activation.reload()
    }

    pub fn set_delay(&self, kind: DelayKind, value: Option<String>) -> OtaResult<()> {
        self.delay.set_delay(kind, value).map(|_| ())
    }

    pub fn cancel_delay(&self) -> OtaResult<()> {
        self.delay.cancel_delay()
    }

    pub fn get_delay(&self) -> Option<DelayDirective> {
        self.delay.current()
    }

    pub async fn get_latest(&self, allow_delay: bool) -> OtaResult<LatestVersion> {
        let poller = self
            .poller
            .as_ref()
            .ok_or_else(|| OtaError::Config("updateUrl is not configured".into()))?;
        let latest = poller.check_for_update(allow_delay).await?;
        info!("Latest version {}: {:?}", latest.version, latest.outcome);
        Ok(latest)
    }

    pub fn get_id(&self) -> &str {
        &self.device_id
    }

    pub fn get_plugin_version(&self) -> &'static str {
        PLUGIN_VERSION
    }

    pub fn is_auto_update_enabled(&self) -> bool {
        self.config.auto_update && self.poller.is_some()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    pub fn remove_all_listeners(&self) {
        self.events.remove_all_listeners();
    }

    pub fn phase(&self) -> ActivationPhase {
        self.activation.phase()
    }
}
