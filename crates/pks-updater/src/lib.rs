//! # pks-updater
//!
//! Self-update system for the Puenkaset point-of-sale application.
//!
//! This crate handles:
//! - Release discovery against a GitHub-style release registry
//! - Encrypted storage of the registry access token
//! - Package download with resume, retry and cancellation
//! - Versioned schema migrations with database backup and restore
//! - Package installation and application restart
//!
//! ## Safety
//!
//! - The store database is backed up before any migration runs
//! - A failed install restores that backup automatically
//! - Archive entries are validated before anything is written
//! - Only one update operation runs at a time

pub mod config;
pub mod credential;
pub mod database;
pub mod error;
pub mod events;
pub mod install;
pub mod manager;
pub mod migrate;
pub mod migrations;
#[cfg(test)]
mod proptests;
pub mod registry;
#[cfg(test)]
mod test_support;
pub mod transfer;

// Re-export main types for convenience
pub use config::{UpdateConfig, UpdateConfigPatch, UpdaterSettings};
pub use credential::{PlatformProtector, SecureCredentialStore};
pub use database::Database;
pub use error::UpdateError;
pub use events::{EventBus, Phase, UpdateEvent};
pub use install::{ArchiveInstaller, ExecutableInstaller, PackageInstaller, ProcessRestarter, Restarter};
pub use manager::{
    is_update_available, RegistryConnection, SchemaStatus, UpdateInfo, UpdateManager, UpdateState,
    UpdateStatus,
};
pub use migrate::{AppliedMigration, RollbackReport, SchemaMigrator};
pub use migrations::{Migration, MIGRATIONS};
pub use registry::{Asset, ReleaseInfo, ReleaseSource, RemoteReleaseClient};
pub use transfer::{DownloadProgress, DownloadStatus, HashAlgorithm, TransferManager};
