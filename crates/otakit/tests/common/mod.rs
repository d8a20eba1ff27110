//! Shared fakes for the integration tests.
//!
//! A [`Harness`] owns one state directory. Every call to
//! [`Harness::updater`] builds a fresh updater over it, which is how the
//! tests simulate a process restart.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use otakit::transport::Progress;
use otakit::{
    Bundle, BundleId, EventKind, FetchOutcome, FetchRequest, FileStorage, HostBridge,
    LatestRequest, LatestResponse, ManualClock, OtaError, OtaResult, StatsReporter, Storage,
    Transport, UpdateSource, Updater, UpdaterConfig, UpdaterEvent,
};

// ============================================================================
// Host
// ============================================================================

pub struct FakeHost {
    pub reloads: Mutex<Vec<BundleId>>,
    pub native: Mutex<String>,
}

impl FakeHost {
    pub fn new(native: &str) -> Self {
        Self {
            reloads: Mutex::new(Vec::new()),
            native: Mutex::new(native.to_string()),
        }
    }

    pub fn set_native(&self, version: &str) {
        *self.native.lock().unwrap() = version.to_string();
    }

    pub fn reloads(&self) -> Vec<BundleId> {
        self.reloads.lock().unwrap().clone()
    }
}

impl HostBridge for FakeHost {
    fn reload(&self, bundle: &Bundle, _path: Option<&Path>) -> OtaResult<()> {
        self.reloads.lock().unwrap().push(bundle.id.clone());
        Ok(())
    }

    fn native_version(&self) -> String {
        self.native.lock().unwrap().clone()
    }

    fn platform(&self) -> String {
        "ios".to_string()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Writes an `index.html` into the destination, optionally held on a gate
#[derive(Default)]
pub struct FakeTransport {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub skip_entry_file: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeTransport {
    /// Block every fetch until the returned semaphore gets permits
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        progress: Progress<'_>,
    ) -> OtaResult<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress(0);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| OtaError::NetworkError("gate closed".into()))?;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(OtaError::NetworkError(format!(
                "connection reset fetching {}",
                request.url
            )));
        }

        progress(50);
        // Repeated and out-of-order values must not reach listeners
        progress(50);
        progress(30);
        fs::create_dir_all(dest)?;
        if !self.skip_entry_file.load(Ordering::SeqCst) {
            fs::write(dest.join("index.html"), format!("<html>{}</html>", request.version))?;
        }
        progress(100);
        Ok(FetchOutcome {
            checksum: Some(format!("sum-{}", request.version)),
        })
    }
}

// ============================================================================
// Update server
// ============================================================================

#[derive(Default)]
pub struct FakeSource {
    pub responses: Mutex<VecDeque<OtaResult<LatestResponse>>>,
    pub requests: Mutex<Vec<LatestRequest>>,
}

impl FakeSource {
    pub fn respond(&self, response: LatestResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn fail(&self, error: OtaError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<LatestRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdateSource for FakeSource {
    async fn latest(&self, request: &LatestRequest) -> OtaResult<LatestResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(LatestResponse::default()))
    }
}

pub fn latest(version: &str, major: Option<bool>) -> LatestResponse {
    LatestResponse {
        version: Some(version.to_string()),
        major,
        url: Some(format!("https://cdn.example.com/{}.zip", version)),
        ..LatestResponse::default()
    }
}

pub fn request(version: &str) -> FetchRequest {
    FetchRequest {
        url: format!("https://cdn.example.com/{}.zip", version),
        version: version.to_string(),
        checksum: None,
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub temp: TempDir,
    pub host: Arc<FakeHost>,
    pub transport: Arc<FakeTransport>,
    pub source: Arc<FakeSource>,
    pub clock: ManualClock,
    pub config: UpdaterConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(UpdaterConfig::default())
    }

    pub fn with_config(config: UpdaterConfig) -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            host: Arc::new(FakeHost::new("1.0.0")),
            transport: Arc::new(FakeTransport::default()),
            source: Arc::new(FakeSource::default()),
            clock: ManualClock::new(Utc::now()),
            config,
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::new(FileStorage::new(self.temp.path()))
    }

    pub fn try_updater(&self) -> OtaResult<Updater> {
        Updater::builder(self.storage(), self.host.clone())
            .config(self.config.clone())
            .transport(self.transport.clone())
            .update_source(self.source.clone())
            .clock(Arc::new(self.clock.clone()))
            .stats(StatsReporter::disabled())
            .build()
    }

    /// A fresh updater over the same state, as after a process restart
    pub fn updater(&self) -> Updater {
        self.try_updater().unwrap()
    }

    /// Restart: new updater plus the startup pass
    pub fn restart(&self) -> Updater {
        let updater = self.updater();
        updater.startup().unwrap();
        updater
    }

    pub fn past_readiness_deadline(&self) {
        let ms = self.config.app_ready_timeout as i64;
        self.clock.advance(Duration::milliseconds(ms + 1));
    }
}

/// Collect every event of `kind`
pub fn record(updater: &Updater, kind: EventKind) -> Arc<Mutex<Vec<UpdaterEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // Handle dropped on purpose: listeners live until removed
    let _ = updater.subscribe(kind, move |event| sink.lock().unwrap().push(event.clone()));
    seen
}
