//! Configuration structures for the update system.
//!
//! `UpdaterSettings` is the on-disk TOML document. Its `[update]` table is the
//! user-facing [`UpdateConfig`]; the remaining tables hold lower-level settings
//! consumed by the registry client, the transfer manager and path resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Complete updater settings file.
///
/// # Example TOML
///
/// ```toml
/// [update]
/// auto_check = true
/// check_interval_ms = 86400000
/// backup_before_update = true
/// max_backups = 5
///
/// [registry]
/// owner = "puenkaset"
/// repo = "pos"
///
/// [transfer]
/// retries = 5
/// retry_delay_ms = 5000
///
/// [paths]
/// database = "/var/lib/puenkaset/store.db"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterSettings {
    /// User-facing update behaviour
    #[serde(default)]
    pub update: UpdateConfig,

    /// Remote release registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Artifact downloads
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UpdaterSettings {
    /// Settings file under the platform data directory.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("updater.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the file at `path`, writing defaults there first if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, UpdateError> {
        if !path.exists() {
            let settings = Self::default();
            settings.save_to_file(path)?;
            return Ok(settings);
        }
        Self::load_from_file(path)
    }

    /// Apply `GITHUB_OWNER`, `GITHUB_REPO` and `GITHUB_TOKEN` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply registry overrides from an arbitrary lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(owner) = non_empty("GITHUB_OWNER") {
            self.registry.owner = owner;
        }
        if let Some(repo) = non_empty("GITHUB_REPO") {
            self.registry.repo = repo;
        }
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.registry.token = Some(token);
        }
    }

    /// Reject values the updater cannot work with.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.registry.owner.trim().is_empty() || self.registry.repo.trim().is_empty() {
            return Err(UpdateError::ConfigError(
                "registry owner and repo must be set".to_string(),
            ));
        }
        if !self.registry.api_base.starts_with("http://")
            && !self.registry.api_base.starts_with("https://")
        {
            return Err(UpdateError::ConfigError(format!(
                "registry api_base must be an http(s) URL: {}",
                self.registry.api_base
            )));
        }
        if self.transfer.retries == 0 {
            return Err(UpdateError::ConfigError(
                "transfer retries must be at least 1".to_string(),
            ));
        }
        if self.update.max_backups == 0 {
            return Err(UpdateError::ConfigError(
                "max_backups must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// User-facing update behaviour, read and written as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Check for updates on startup and on every interval
    #[serde(default = "default_true")]
    pub auto_check: bool,

    /// Milliseconds between automatic checks
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Download as soon as an update is found
    #[serde(default)]
    pub auto_download: bool,

    /// Install as soon as a download completes
    #[serde(default)]
    pub auto_install: bool,

    /// Consider pre-release tags when resolving the latest release
    #[serde(default)]
    pub allow_prerelease: bool,

    /// Snapshot the database before migrating
    #[serde(default = "default_true")]
    pub backup_before_update: bool,

    /// Number of database backups to keep
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_check: true,
            check_interval_ms: default_check_interval_ms(),
            auto_download: false,
            auto_install: false,
            allow_prerelease: false,
            backup_before_update: true,
            max_backups: default_max_backups(),
        }
    }
}

impl UpdateConfig {
    /// Interval between automatic checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Merge a patch into a copy of this config.
    ///
    /// Fails with `InvalidInput` when the merged result is unusable, in which
    /// case nothing is applied.
    pub fn merged(&self, patch: &UpdateConfigPatch) -> Result<Self, UpdateError> {
        let mut next = self.clone();
        if let Some(v) = patch.auto_check {
            next.auto_check = v;
        }
        if let Some(v) = patch.check_interval_ms {
            next.check_interval_ms = v;
        }
        if let Some(v) = patch.auto_download {
            next.auto_download = v;
        }
        if let Some(v) = patch.auto_install {
            next.auto_install = v;
        }
        if let Some(v) = patch.allow_prerelease {
            next.allow_prerelease = v;
        }
        if let Some(v) = patch.backup_before_update {
            next.backup_before_update = v;
        }
        if let Some(v) = patch.max_backups {
            next.max_backups = v;
        }

        if next.max_backups == 0 {
            return Err(UpdateError::InvalidInput(
                "max_backups must be at least 1".to_string(),
            ));
        }
        if next.check_interval_ms < MIN_CHECK_INTERVAL_MS {
            return Err(UpdateError::InvalidInput(format!(
                "check_interval_ms must be at least {}",
                MIN_CHECK_INTERVAL_MS
            )));
        }
        Ok(next)
    }
}

/// Partial update of [`UpdateConfig`]; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_download: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_install: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_prerelease: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_before_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backups: Option<usize>,
}

impl UpdateConfigPatch {
    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Remote release registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Repository owner
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Repository name
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Access token; the secure credential store takes precedence when populated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts for registry queries
    #[serde(default = "default_registry_retries")]
    pub retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            repo: default_repo(),
            token: None,
            api_base: default_api_base(),
            timeout_secs: default_registry_timeout(),
            retries: default_registry_retries(),
        }
    }
}

/// Artifact download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,

    /// Attempts per download, including the first
    #[serde(default = "default_transfer_retries")]
    pub retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Write buffer size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Continue partial files with range requests
    #[serde(default = "default_true")]
    pub resume_support: bool,

    /// Minimum spacing of progress events in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_transfer_timeout(),
            retries: default_transfer_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            chunk_size: default_chunk_size(),
            resume_support: true,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Filesystem layout. Empty entries resolve to platform defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Application data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Primary database file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,

    /// Staging directory for downloads and extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,

    /// Directory archive payloads are installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Application data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Primary database file.
    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir().join("store.db"))
    }

    /// Download staging directory.
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("puenkaset-update"))
    }

    /// Install target for archive payloads, defaulting to the running executable's directory.
    pub fn install_dir(&self) -> PathBuf {
        if let Some(dir) = &self.install_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Encrypted token record.
    pub fn credential_file(&self) -> PathBuf {
        self.data_dir().join("secure-tokens.dat")
    }

    /// Local encryption key.
    pub fn key_file(&self) -> PathBuf {
        self.data_dir().join("encryption.key")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Lower bound for automatic check spacing.
const MIN_CHECK_INTERVAL_MS: u64 = 60_000;

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_max_backups() -> usize {
    5
}

fn default_owner() -> String {
    "puenkaset".to_string()
}

fn default_repo() -> String {
    "pos".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_registry_retries() -> u32 {
    3
}

fn default_transfer_timeout() -> u64 {
    60
}

fn default_transfer_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Get the default application data directory.
fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Puenkaset");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("Puenkaset");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("puenkaset");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("puenkaset");
        }
    }

    // Fallback
    PathBuf::from(".").join("puenkaset-data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_update_config() {
        let config = UpdateConfig::default();
        assert!(config.auto_check);
        assert_eq!(config.check_interval_ms, 86_400_000);
        assert!(!config.auto_download);
        assert!(!config.auto_install);
        assert!(!config.allow_prerelease);
        assert!(config.backup_before_update);
        assert_eq!(config.max_backups, 5);
    }

    #[test]
    fn test_registry_and_transfer_defaults() {
        let registry = RegistryConfig::default();
        assert_eq!(registry.api_base, "https://api.github.com");
        assert_eq!(registry.timeout_secs, 30);
        assert_eq!(registry.retries, 3);
        assert!(registry.token.is_none());

        let transfer = TransferConfig::default();
        assert_eq!(transfer.timeout_secs, 60);
        assert_eq!(transfer.retries, 5);
        assert_eq!(transfer.retry_delay_ms, 5000);
        assert_eq!(transfer.chunk_size, 1024 * 1024);
        assert!(transfer.resume_support);
        assert_eq!(transfer.progress_interval_ms, 100);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: UpdaterSettings = toml::from_str(
            r#"
            [update]
            auto_download = true

            [registry]
            owner = "acme"
            "#,
        )
        .unwrap();

        assert!(settings.update.auto_download);
        assert!(settings.update.auto_check);
        assert_eq!(settings.registry.owner, "acme");
        assert_eq!(settings.registry.repo, "pos");
        assert_eq!(settings.transfer.retries, 5);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("updater.toml");

        let mut settings = UpdaterSettings::default();
        settings.update.max_backups = 2;
        settings.paths.database = Some(temp.path().join("store.db"));
        settings.save_to_file(&path).unwrap();

        let loaded = UpdaterSettings::load_from_file(&path).unwrap();
        assert_eq!(loaded.update.max_backups, 2);
        assert_eq!(loaded.paths.database(), temp.path().join("store.db"));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updater.toml");

        let settings = UpdaterSettings::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings.update, UpdateConfig::default());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("updater.toml");
        std::fs::write(&path, "[update\nbroken").unwrap();

        let result = UpdaterSettings::load_from_file(&path);
        assert!(matches!(result, Err(UpdateError::ConfigError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = UpdaterSettings::default();
        settings.apply_overrides_from(|key| match key {
            "GITHUB_OWNER" => Some("someone".to_string()),
            "GITHUB_REPO" => Some("  ".to_string()),
            "GITHUB_TOKEN" => Some("ghp_x".to_string()),
            _ => None,
        });

        assert_eq!(settings.registry.owner, "someone");
        assert_eq!(settings.registry.repo, "pos");
        assert_eq!(settings.registry.token.as_deref(), Some("ghp_x"));
    }

    #[test]
    fn test_patch_merge() {
        let config = UpdateConfig::default();
        let patch = UpdateConfigPatch {
            auto_install: Some(true),
            max_backups: Some(3),
            ..Default::default()
        };

        let merged = config.merged(&patch).unwrap();
        assert!(merged.auto_install);
        assert_eq!(merged.max_backups, 3);
        assert_eq!(merged.check_interval_ms, config.check_interval_ms);
        assert!(!patch.is_empty());
        assert!(UpdateConfigPatch::default().is_empty());
    }

    #[test]
    fn test_patch_rejects_zero_backups() {
        let patch = UpdateConfigPatch {
            max_backups: Some(0),
            ..Default::default()
        };
        let result = UpdateConfig::default().merged(&patch);
        assert!(matches!(result, Err(UpdateError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_bad_api_base() {
        let mut settings = UpdaterSettings::default();
        settings.registry.api_base = "ftp://example.com".to_string();
        assert!(settings.validate().is_err());
    }
}
