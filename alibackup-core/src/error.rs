/*!
Error types for the alibackup core library.
*/

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout alibackup.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Provider error code ECS returns when deleting a snapshot that no longer exists.
pub const SNAPSHOT_NOT_FOUND_CODE: &str = "InvalidSnapshotId.NotFound";

/// Provider error code OSS returns for a missing object.
pub const NO_SUCH_KEY_CODE: &str = "NoSuchKey";

/// Domain-neutral error reported by an OSS or ECS client.
///
/// Capability traits return this instead of SDK-specific types so adapters can
/// recognise "not found" without knowing which client produced the failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    /// Create an error carrying only a message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach a provider error code
    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach an HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the provider request id
    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Provider error code, if any
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Whether ECS reported the snapshot itself as absent.
    ///
    /// Narrower than [`ApiError::is_not_found`]: other 404s, such as an
    /// unknown region, do not count.
    pub fn is_snapshot_not_found(&self) -> bool {
        self.code() == Some(SNAPSHOT_NOT_FOUND_CODE)
    }

    /// Whether the provider reported the target as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code(),
            Some(NO_SUCH_KEY_CODE) | Some(SNAPSHOT_NOT_FOUND_CODE) | Some("NotFound")
        ) || self.status == Some(404)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.status) {
            (Some(code), Some(status)) => write!(f, "{code} (status {status}): {}", self.message)?,
            (Some(code), None) => write!(f, "{code}: {}", self.message)?,
            (None, Some(status)) => write!(f, "status {status}: {}", self.message)?,
            (None, None) => write!(f, "{}", self.message)?,
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " (request id: {request_id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Errors surfaced by the plugin adapters.
#[derive(Error, Debug)]
pub enum PluginError {
    /// User-facing configuration problems; never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// The credentials file could not be read or parsed
    #[error("error loading credentials file ({}): {reason}", .path.display())]
    CredentialsFile { path: PathBuf, reason: String },

    /// Instance-metadata service failures
    #[error("Instance metadata error: {0}")]
    Metadata(String),

    /// RAM role could not be exchanged for STS credentials
    #[error("Failed to get STS token from RAM role {role}: {message}")]
    TokenExchange { role: String, message: String },

    /// OSS or ECS call failed
    #[error("{operation} failed for {resource}: {source}")]
    Provider {
        operation: &'static str,
        resource: String,
        #[source]
        source: ApiError,
    },

    /// Provider response violated its contract
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Resource manifest could not be interpreted
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new metadata error
    pub fn metadata<S: Into<String>>(msg: S) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a new manifest error
    pub fn manifest<S: Into<String>>(msg: S) -> Self {
        Self::Manifest(msg.into())
    }

    /// Wrap a provider error with the operation and resource it concerned
    pub fn provider<S: Into<String>>(operation: &'static str, resource: S, source: ApiError) -> Self {
        Self::Provider {
            operation,
            resource: resource.into(),
            source,
        }
    }

    /// Whether this error is a provider "not found" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Provider { source, .. } if source.is_not_found())
    }

    /// Whether this error is ECS reporting a missing snapshot
    pub fn is_snapshot_not_found(&self) -> bool {
        matches!(self, Self::Provider { source, .. } if source.is_snapshot_not_found())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
