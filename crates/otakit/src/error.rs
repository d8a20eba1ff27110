//! Error types for otakit.

use thiserror::Error;

use crate::bundle::BundleStatus;

pub type OtaResult<T> = std::result::Result<T, OtaError>;

/// Every failure the core can report.
///
/// Errors are `Clone` so one download result can be handed to every caller
/// waiting on the same in-flight transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("Bundle not found: {0}")]
    NotFound(String),

    #[error("Invalid bundle {id}: {reason}")]
    InvalidBundle { id: String, reason: String },

    #[error("Bundle in use: {0}")]
    InUse(String),

    #[error("Bundle already exists for version {0}")]
    AlreadyExists(String),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: BundleStatus,
        to: BundleStatus,
    },

    #[error("No activation pending confirmation")]
    NoActivationPending,

    #[error("Activation of {id} was never confirmed")]
    ActivationFailure { id: String },

    #[error("Download already in progress for version {0}")]
    DownloadInProgress(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OtaError {
    pub fn invalid_bundle(id: impl Into<String>, reason: impl Into<String>) -> Self {
        OtaError::InvalidBundle {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OtaError::NetworkError(_) | OtaError::DownloadInProgress(_))
    }

    /// Stable short code, used in CLI output and stats payloads.
    pub fn code(&self) -> &'static str {
        match self {
            OtaError::NotFound(_) => "not_found",
            OtaError::InvalidBundle { .. } => "invalid_bundle",
            OtaError::InUse(_) => "in_use",
            OtaError::AlreadyExists(_) => "already_exists",
            OtaError::InvalidTransition { .. } => "invalid_transition",
            OtaError::NoActivationPending => "no_activation_pending",
            OtaError::ActivationFailure { .. } => "activation_failure",
            OtaError::DownloadInProgress(_) => "download_in_progress",
            OtaError::NetworkError(_) => "network_error",
            OtaError::ServerError { .. } => "server_error",
            OtaError::InvalidArgument(_) => "invalid_argument",
            OtaError::Storage(_) => "storage_error",
            OtaError::Config(_) => "config_error",
        }
    }
}

impl From<std::io::Error> for OtaError {
    fn from(e: std::io::Error) -> Self {
        OtaError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(e: serde_json::Error) -> Self {
        OtaError::Storage(format!("JSON error: {}", e))
    }
}

impl From<reqwest::Error> for OtaError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => OtaError::ServerError {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => OtaError::NetworkError(e.to_string()),
        }
    }
}
