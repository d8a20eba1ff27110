//! Updater Configuration
//!
//! Config file: ~/.config/otakit/config.toml or /etc/otakit/config.toml
//!
//! Keys use the host-facing camelCase names. Any key may be overridden per
//! platform:
//!
//! ```toml
//! appReadyTimeout = 10000
//! updateUrl = "https://updates.example.com/latest"
//!
//! [platforms.android]
//! appReadyTimeout = 15000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OtaError, OtaResult};

/// Default readiness window after an activation
pub const DEFAULT_APP_READY_TIMEOUT_MS: u64 = 10_000;

/// Longest accepted readiness window (one day)
pub const MAX_APP_READY_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Longest accepted value for the `*Secs` intervals (thirty days)
pub const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Main updater configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdaterConfig {
    /// Milliseconds a newly activated bundle has to call notifyAppReady
    pub app_ready_timeout: u64,
    /// Delete bundles that failed to download or to confirm
    pub auto_delete_failed: bool,
    /// Delete the previous bundle once a newer one is confirmed
    pub auto_delete_previous: bool,
    /// Poll the update server in the background
    pub auto_update: bool,
    pub update_url: Option<String>,
    pub stats_url: Option<String>,
    /// Drop downloaded bundles when the native app version changes
    pub reset_when_update: bool,
    /// Download and queue updates flagged as major without asking the host
    pub allow_major_auto_update: bool,
    /// Roll failed activations back to the last confirmed bundle instead of builtin
    pub rollback_to_last_successful: bool,
    /// File that must exist in a bundle for it to be activatable
    pub entry_file: String,
    /// Age after which a bundle still downloading at startup is considered dead
    pub stale_download_secs: u64,
    /// Interval between background update checks
    pub check_interval_secs: u64,
    /// Timeout for update checks and stats requests
    pub request_timeout_secs: u64,
    /// Application identifier sent to the update server
    pub app_id: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            app_ready_timeout: DEFAULT_APP_READY_TIMEOUT_MS,
            auto_delete_failed: true,
            auto_delete_previous: true,
            auto_update: false,
            update_url: None,
            stats_url: None,
            reset_when_update: true,
            allow_major_auto_update: false,
            rollback_to_last_successful: false,
            entry_file: "index.html".to_string(),
            stale_download_secs: 600, // 10 minutes
            check_interval_secs: 600, // 10 minutes
            request_timeout_secs: 10,
            app_id: None,
        }
    }
}

impl UpdaterConfig {
    /// Get default user config path: ~/.config/otakit/config.toml
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("otakit").join("config.toml"))
    }

    /// Get system config path: /etc/otakit/config.toml
    pub fn system_config_path() -> PathBuf {
        PathBuf::from("/etc/otakit/config.toml")
    }

    /// Load configuration for a platform
    ///
    /// Priority:
    /// 1. Explicit path (when given)
    /// 2. User config (~/.config/otakit/config.toml)
    /// 3. System config (/etc/otakit/config.toml)
    /// 4. Defaults
    pub fn load(path: Option<&Path>, platform: &str) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_file(path, platform);
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                return Self::load_file(&user_path, platform);
            }
        }

        let system_path = Self::system_config_path();
        if system_path.exists() {
            return Self::load_file(&system_path, platform);
        }

        Ok(Self::default())
    }

    /// Load one config file
    pub fn load_file(path: &Path, platform: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml_str(&contents, platform)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parse TOML, applying `[platforms.<platform>]` over the base keys
    pub fn from_toml_str(contents: &str, platform: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(contents).context("Malformed TOML")?;

        let overrides = match table.remove("platforms") {
            Some(toml::Value::Table(mut platforms)) => platforms.remove(platform),
            Some(_) => anyhow::bail!("'platforms' must be a table of per-platform overrides"),
            None => None,
        };

        match overrides {
            Some(toml::Value::Table(overrides)) => {
                for (key, value) in overrides {
                    table.insert(key, value);
                }
            }
            Some(_) => anyhow::bail!("'platforms.{}' must be a table", platform),
            None => {}
        }

        let config: UpdaterConfig = toml::Value::Table(table)
            .try_into()
            .context("Mistyped configuration value")?;
        Ok(config)
    }

    pub fn validate(&self) -> OtaResult<()> {
        if self.app_ready_timeout == 0 {
            return Err(OtaError::Config("appReadyTimeout must be greater than 0".into()));
        }
        if self.app_ready_timeout > MAX_APP_READY_TIMEOUT_MS {
            return Err(OtaError::Config(format!(
                "appReadyTimeout must be at most {} ms, got {}",
                MAX_APP_READY_TIMEOUT_MS, self.app_ready_timeout
            )));
        }
        for (name, secs) in [
            ("staleDownloadSecs", self.stale_download_secs),
            ("checkIntervalSecs", self.check_interval_secs),
            ("requestTimeoutSecs", self.request_timeout_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(OtaError::Config(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_INTERVAL_SECS, secs
                )));
            }
        }
        if self.entry_file.trim().is_empty() {
            return Err(OtaError::Config("entryFile must not be empty".into()));
        }
        for (name, url) in [("updateUrl", &self.update_url), ("statsUrl", &self.stats_url)] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(OtaError::Config(format!(
                        "{} must be an http(s) URL, got '{}'",
                        name, url
                    )));
                }
            }
        }
        Ok(())
    }

    // The accessors clamp to the validated range so an unvalidated config
    // cannot overflow chrono arithmetic.

    pub fn app_ready_timeout(&self) -> chrono::Duration {
        let ms = self.app_ready_timeout.min(MAX_APP_READY_TIMEOUT_MS);
        chrono::Duration::milliseconds(ms as i64)
    }

    /// Age after which an in-flight download left over from a previous run is dead
    pub fn stale_download_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_download_secs.min(MAX_INTERVAL_SECS) as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.clamp(1, MAX_INTERVAL_SECS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.clamp(1, MAX_INTERVAL_SECS))
    }
}
