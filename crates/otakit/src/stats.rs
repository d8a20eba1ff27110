//! Stats Reporter - fire-and-forget lifecycle statistics.
//!
//! Reporting never blocks or fails the operation being reported: events go
//! into an unbounded channel and a background task posts them to `statsUrl`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::OtaResult;
use crate::PLUGIN_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsAction {
    DownloadComplete,
    DownloadFail,
    Set,
    SetNext,
    UpdateFail,
    Reset,
    Delete,
    AppReady,
}

/// One posted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEvent {
    pub action: StatsAction,
    pub device_id: String,
    pub version_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_version_name: Option<String>,
    pub platform: String,
    pub plugin_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsReporter {
    tx: Option<mpsc::UnboundedSender<StatsEvent>>,
    device_id: String,
    platform: String,
    app_id: Option<String>,
}

impl StatsReporter {
    /// Reporter that drops everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reporter feeding a caller-owned receiver
    pub fn channel(
        device_id: impl Into<String>,
        platform: impl Into<String>,
        app_id: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<StatsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            tx: Some(tx),
            device_id: device_id.into(),
            platform: platform.into(),
            app_id,
        };
        (reporter, rx)
    }

    /// Reporter plus the task posting to `url`; must be called inside a tokio runtime
    pub fn spawn(
        url: &str,
        timeout: Duration,
        device_id: impl Into<String>,
        platform: impl Into<String>,
        app_id: Option<String>,
    ) -> OtaResult<(Self, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .user_agent(format!("otakit/{}", PLUGIN_VERSION))
            .timeout(timeout)
            .build()?;
        let (reporter, rx) = Self::channel(device_id, platform, app_id);

        info!("Stats reporting to {}", url);
        let url = url.to_string();
        let handle = tokio::spawn(async move { deliver(client, url, rx).await });
        Ok((reporter, handle))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn record(&self, action: StatsAction, version: &str, old_version: Option<&str>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = StatsEvent {
            action,
            device_id: self.device_id.clone(),
            version_name: version.to_string(),
            old_version_name: old_version.map(str::to_string),
            platform: self.platform.clone(),
            plugin_version: PLUGIN_VERSION.to_string(),
            app_id: self.app_id.clone(),
        };
        if tx.send(event).is_err() {
            debug!("Stats task gone, dropping {:?}", action);
        }
    }
}

/// Post events until every sender is dropped
async fn deliver(client: reqwest::Client, url: String, mut rx: mpsc::UnboundedReceiver<StatsEvent>) {
    while let Some(event) = rx.recv().await {
        let result = client
            .post(&url)
            .json(&event)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(e) = result {
            debug!("Stats post for {:?} failed: {}", event.action, e);
        }
    }
    debug!("Stats task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_drops_silently() {
        let reporter = StatsReporter::disabled();
        assert!(!reporter.is_enabled());
        reporter.record(StatsAction::Reset, "builtin", None);
    }

    #[test]
    fn test_record_fills_identity() {
        let (reporter, mut rx) = StatsReporter::channel("dev-1", "android", Some("com.example".into()));
        reporter.record(StatsAction::Set, "1.1.0", Some("1.0.0"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.action, StatsAction::Set);
        assert_eq!(event.device_id, "dev-1");
        assert_eq!(event.platform, "android");
        assert_eq!(event.old_version_name.as_deref(), Some("1.0.0"));
        assert_eq!(event.plugin_version, PLUGIN_VERSION);
    }

    #[test]
    fn test_payload_shape() {
        let (reporter, mut rx) = StatsReporter::channel("dev-1", "ios", None);
        reporter.record(StatsAction::DownloadFail, "1.2.0", None);
        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["action"], "download_fail");
        assert_eq!(json["version_name"], "1.2.0");
        assert!(json.get("old_version_name").is_none());
    }
}
