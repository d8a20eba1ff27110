//! Host bridge for a command-line process: there is no web view to reload.

use otakit::{Bundle, HostBridge, OtaResult};
use std::path::Path;
use tracing::info;

pub struct CliHost {
    native_version: String,
    platform: String,
}

impl CliHost {
    pub fn new(native_version: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            native_version: native_version.into(),
            platform: platform.into(),
        }
    }
}

impl HostBridge for CliHost {
    fn reload(&self, bundle: &Bundle, path: Option<&Path>) -> OtaResult<()> {
        match path {
            Some(path) => info!("Reload: {} {} from {}", bundle.id, bundle.version, path.display()),
            None => info!("Reload: builtin bundle"),
        }
        Ok(())
    }

    fn native_version(&self) -> String {
        self.native_version.clone()
    }

    fn platform(&self) -> String {
        self.platform.clone()
    }
}
