//! Auto-Update Poller - asks the update server what to run next.
//!
//! One check: report the current version, classify the answer, then either
//! do nothing, announce a major update, or download and queue the bundle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::activation::ActivationController;
use crate::bundle::{Bundle, BundleId};
use crate::config::UpdaterConfig;
use crate::download::DownloadManager;
use crate::error::{OtaError, OtaResult};
use crate::events::{EventEmitter, UpdaterEvent};
use crate::host::HostBridge;
use crate::identity;
use crate::state::StateStore;
use crate::transport::FetchRequest;
use crate::version;
use crate::PLUGIN_VERSION;

/// Delay before the first background check after startup
pub const INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Body sent to the update server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestRequest {
    pub device_id: String,
    /// Version of the bundle currently rendered
    pub version_name: String,
    /// Native app version
    pub version_build: String,
    pub platform: String,
    pub plugin_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// Update server answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestResponse {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub major: Option<bool>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn latest(&self, request: &LatestRequest) -> OtaResult<LatestResponse>;
}

/// Update server reached over HTTP(S)
pub struct HttpUpdateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpUpdateSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> OtaResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("otakit/{}", PLUGIN_VERSION))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn latest(&self, request: &LatestRequest) -> OtaResult<LatestResponse> {
        let response = self.client.post(&self.url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OtaError::ServerError {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            });
        }

        response.json().await.map_err(|e| OtaError::ServerError {
            status: status.as_u16(),
            message: format!("Malformed update response: {}", e),
        })
    }
}

/// What a check decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CheckOutcome {
    UpToDate,
    /// Announced through `majorAvailable`; nothing downloaded
    MajorAvailable,
    /// Downloaded and set as next
    Queued { bundle: Bundle },
    /// Downloaded, waiting on the active delay directive
    Staged { bundle: Bundle },
}

/// Result of `getLatest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestVersion {
    pub version: String,
    pub major: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

pub struct AutoUpdatePoller {
    source: Arc<dyn UpdateSource>,
    downloads: DownloadManager,
    activation: Arc<ActivationController>,
    store: Arc<StateStore>,
    host: Arc<dyn HostBridge>,
    events: EventEmitter,
    config: Arc<UpdaterConfig>,
}

impl AutoUpdatePoller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        downloads: DownloadManager,
        activation: Arc<ActivationController>,
        store: Arc<StateStore>,
        host: Arc<dyn HostBridge>,
        events: EventEmitter,
        config: Arc<UpdaterConfig>,
    ) -> Self {
        Self {
            source,
            downloads,
            activation,
            store,
            host,
            events,
            config,
        }
    }

    /// Query the server once and act on the answer.
    ///
    /// Any version other than the running one is fetched and queued, older
    /// ones included: the server decides what a device should run.
    pub async fn check_for_update(&self, allow_delay: bool) -> OtaResult<LatestVersion> {
        let device_id = identity::ensure_device_id(&self.store)?;
        let current = self.activation.current();
        let native_version = self.host.native_version();
        // Builtin reports its own version as the native one
        let base_version = if current.is_builtin() {
            native_version.as_str()
        } else {
            current.version.as_str()
        };

        let request = LatestRequest {
            device_id,
            version_name: base_version.to_string(),
            version_build: native_version.clone(),
            platform: self.host.platform(),
            plugin_version: PLUGIN_VERSION.to_string(),
            app_id: self.config.app_id.clone(),
        };
        debug!("Checking for updates as {}", request.version_name);
        let response = self.source.latest(&request).await?;

        if let Some(message) = response.error.filter(|e| !e.is_empty()) {
            return Err(OtaError::ServerError {
                status: 200,
                message,
            });
        }
        let latest = response
            .version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OtaError::ServerError {
                status: 200,
                message: "Update response has no version".into(),
            })?;

        let major = response
            .major
            .unwrap_or_else(|| version::is_major_bump(base_version, &latest));

        let mut result = LatestVersion {
            version: latest.clone(),
            major,
            url: response.url.clone(),
            message: response.message.clone(),
            outcome: CheckOutcome::UpToDate,
        };

        if latest == current.version || (current.is_builtin() && latest == native_version) {
            debug!("Already on latest version {}", latest);
            return Ok(result);
        }
        if let Some(pending) = self.pending_for(&latest) {
            result.outcome = pending;
            return Ok(result);
        }
        let is_downgrade = version::is_newer(&latest, base_version);
        if is_downgrade {
            info!("Server offers older version {} than {}, applying it", latest, base_version);
        }

        if major && !self.config.allow_major_auto_update {
            info!("Major update {} available, not applying automatically", latest);
            self.events.emit(UpdaterEvent::MajorAvailable {
                version: latest,
            });
            result.outcome = CheckOutcome::MajorAvailable;
            return Ok(result);
        }

        let url = response.url.ok_or_else(|| OtaError::ServerError {
            status: 200,
            message: format!("Update {} has no download url", latest),
        })?;
        let bundle = self
            .downloads
            .download(FetchRequest {
                url,
                version: latest.clone(),
                checksum: response.checksum,
            })
            .await?;

        if allow_delay && self.stage_if_delayed(&bundle)? {
            info!("Bundle {} staged until the delay directive is satisfied", bundle.id);
            result.outcome = CheckOutcome::Staged { bundle };
        } else {
            let bundle = self.activation.set_next(&bundle.id)?;
            result.outcome = CheckOutcome::Queued { bundle };
        }
        Ok(result)
    }

    /// The version is already waiting as next or staged
    fn pending_for(&self, version: &str) -> Option<CheckOutcome> {
        let state = self.store.lock();
        let find = |id: &Option<BundleId>| {
            id.as_ref()
                .and_then(|id| state.bundle(id))
                .filter(|bundle| bundle.version == version)
        };
        if let Some(bundle) = find(&state.staged) {
            return Some(CheckOutcome::Staged { bundle });
        }
        find(&state.next).map(|bundle| CheckOutcome::Queued { bundle })
    }

    fn stage_if_delayed(&self, bundle: &Bundle) -> OtaResult<bool> {
        let mut state = self.store.lock();
        if state.delay.is_none() {
            return Ok(false);
        }
        state.staged = Some(bundle.id.clone());
        state.commit()?;
        Ok(true)
    }

    /// Start the background loop; errors are logged, never propagated
    pub fn spawn(self: Arc<Self>, interval: Duration, initial_delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Auto-update poller started (checks every {}s)",
                interval.as_secs()
            );
            time::sleep(initial_delay).await;

            loop {
                match self.check_for_update(true).await {
                    Ok(latest) => debug!("Update check: {} {:?}", latest.version, latest.outcome),
                    Err(e) if e.is_retryable() => warn!("Update check failed, will retry: {}", e),
                    Err(e) => error!("Update check failed: {}", e),
                }
                time::sleep(interval).await;
            }
        })
    }
}
