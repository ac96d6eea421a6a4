//! Error types for the update system.

use thiserror::Error;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Transport failure or request timeout
    #[error("network error: {0}")]
    Network(String),

    /// Registry rejected the credentials (HTTP 401)
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Registry refused the request because the rate budget is spent (HTTP 403)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Requested release or asset does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Download failed on every attempt
    #[error("download failed after {attempts} attempt(s): {reason}")]
    DownloadFailed { attempts: u32, reason: String },

    /// Downloaded size differs from the announced length
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Archive entry resolves outside the extraction directory
    #[error("archive entry escapes destination: {0}")]
    PathTraversal(String),

    /// A schema migration failed to apply
    #[error("migration {version} failed: {cause}")]
    MigrationFailed { version: String, cause: String },

    /// Malformed token, config value or argument
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stored credential record cannot be decrypted
    #[error("credential decryption failed: {0}")]
    DecryptionError(String),

    /// Another update operation is running
    #[error("an update is already in progress")]
    AlreadyInProgress,

    /// No backup to restore from
    #[error("no backup available")]
    NoBackupAvailable,

    /// Schema ledger could not be created
    #[error("initialization failed: {0}")]
    InitError(String),

    /// Token passed format checks but the registry rejected it
    #[error("token validation failed")]
    TokenValidationFailed,

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Installation failed
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Restoring a backup failed
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Archive could not be read
    #[error("archive error: {0}")]
    Archive(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether a retry may succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::Network(_)
                | UpdateError::RateLimited(_)
                | UpdateError::SizeMismatch { .. }
                | UpdateError::IoError(_)
        )
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpdateError::Network(format!("request timed out: {}", err))
        } else {
            UpdateError::Network(err.to_string())
        }
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}

impl From<zip::result::ZipError> for UpdateError {
    fn from(err: zip::result::ZipError) -> Self {
        UpdateError::Archive(err.to_string())
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        UpdateError::IoError(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}
