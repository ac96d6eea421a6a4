//! Puenkaset updater CLI
//!
//! This crate provides a command-line interface for:
//! - Checking for, downloading and installing POS updates
//! - Managing the update configuration and registry token
//! - Inspecting and backing up the store database
//! - Running the automatic update loop

pub mod cli;
pub mod output;

use pks_updater::UpdateError;

pub use cli::Cli;
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Authentication failed - token rejected or unreadable
/// - 3: Connection failed - registry or download host unreachable
/// - 4: Invalid input - bad arguments, config or state
/// - 5: Busy - another update operation is running
/// - 6: Cancelled - the operation was cancelled
/// - 7: Database error - migration, backup or integrity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Authentication failed (exit code 2)
    AuthenticationFailed = 2,
    /// Connection failed (exit code 3)
    ConnectionFailed = 3,
    /// Invalid input provided (exit code 4)
    InvalidInput = 4,
    /// Another operation is running (exit code 5)
    Busy = 5,
    /// Operation cancelled (exit code 6)
    Cancelled = 6,
    /// Database problem (exit code 7)
    DatabaseError = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Exit code for a failed command.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<UpdateError>() {
            Some(e) => Self::from_update_error(e),
            None => ExitCode::GeneralError,
        }
    }

    pub fn from_update_error(err: &UpdateError) -> Self {
        match err {
            UpdateError::AuthFailed(_)
            | UpdateError::TokenValidationFailed
            | UpdateError::DecryptionError(_) => ExitCode::AuthenticationFailed,
            UpdateError::Network(_)
            | UpdateError::RateLimited(_)
            | UpdateError::DownloadFailed { .. } => ExitCode::ConnectionFailed,
            UpdateError::InvalidInput(_)
            | UpdateError::InvalidState(_)
            | UpdateError::ConfigError(_)
            | UpdateError::VersionParseError(_) => ExitCode::InvalidInput,
            UpdateError::AlreadyInProgress => ExitCode::Busy,
            UpdateError::Cancelled => ExitCode::Cancelled,
            UpdateError::MigrationFailed { .. }
            | UpdateError::RollbackFailed(_)
            | UpdateError::NoBackupAvailable
            | UpdateError::InitError(_)
            | UpdateError::Database(_) => ExitCode::DatabaseError,
            _ => ExitCode::GeneralError,
        }
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::Busy => "BUSY",
            ExitCode::Cancelled => "CANCELLED",
            ExitCode::DatabaseError => "DATABASE_ERROR",
        }
    }
}
