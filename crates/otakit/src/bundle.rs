//! Bundle model and the builtin sentinel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Id and version of the bundle shipped inside the app-store binary.
pub const BUILTIN_ID: &str = "builtin";

/// Opaque bundle identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    /// Generate a fresh id for a new bundle
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn builtin() -> Self {
        Self(BUILTIN_ID.to_string())
    }

    pub fn is_builtin(&self) -> bool {
        self.0 == BUILTIN_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BundleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bundle download/verification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Downloading,
    Success,
    Error,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Downloading => "downloading",
            BundleStatus::Success => "success",
            BundleStatus::Error => "error",
        }
    }

    /// Whether `self -> to` is a legal registry transition.
    ///
    /// `success -> error` exists for rollback; `error` is terminal.
    pub fn can_transition_to(&self, to: BundleStatus) -> bool {
        use BundleStatus::*;
        match (self, to) {
            (a, b) if *a == b => true,
            (Pending, Downloading) | (Pending, Success) | (Pending, Error) => true,
            (Downloading, Success) | (Downloading, Error) => true,
            (Success, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One installable set of app assets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub version: String,
    pub status: BundleStatus,
    /// Completion time, or creation time while not yet complete
    pub downloaded: DateTime<Utc>,
    /// SHA-256 of the archive when it was verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Bundle {
    pub fn new(version: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: BundleId::generate(),
            version: version.to_string(),
            status: BundleStatus::Pending,
            downloaded: now,
            checksum: None,
        }
    }

    /// The constant sentinel for the app-store-shipped bundle
    pub fn builtin() -> Self {
        Self {
            id: BundleId::builtin(),
            version: BUILTIN_ID.to_string(),
            status: BundleStatus::Success,
            downloaded: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            checksum: None,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id.is_builtin()
    }

    /// Eligible to hold the `current` or `next` pointer (entry file aside)
    pub fn is_activatable(&self) -> bool {
        self.is_builtin() || self.status == BundleStatus::Success
    }
}
