//! Schema migration and database backup management.
//!
//! [`SchemaMigrator`] applies entries of the migration registry to the store
//! database and records each applied version in the `schema_version` ledger.
//! Before a migration batch it can snapshot the database file; the most recent
//! snapshot is the default restore target.
//!
//! Backups live next to the database as `{file}.backup.{timestamp}`, where the
//! timestamp sorts lexicographically in creation order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use semver::Version;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::error::UpdateError;
use crate::migrations::{validate_registry, Migration, MIGRATIONS};

/// Marker between the database file name and the backup timestamp.
const BACKUP_MARKER: &str = ".backup.";

/// Backup timestamp layout, e.g. `20240101T101500.123456Z`.
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Tables whose presence marks a usable store backup.
const KNOWN_TABLES: &[&str] = &["products", "sales", "schema_version"];

/// The version reported for an empty ledger.
pub fn zero_version() -> Version {
    Version::new(0, 0, 0)
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
    pub applied_at: String,
}

/// Outcome of a best-effort rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    /// Versions whose revert step ran
    pub reverted: Vec<String>,
    /// Versions without a revert step; their ledger rows were still removed
    pub skipped: Vec<String>,
    /// Versions that failed, with the cause
    pub failed: Vec<(String, String)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies registry migrations and manages database backups.
pub struct SchemaMigrator {
    db: Arc<Database>,
    registry: &'static [Migration],
    last_backup: Mutex<Option<PathBuf>>,
}

impl SchemaMigrator {
    /// Create a migrator over the compiled-in registry.
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_registry(db, MIGRATIONS)
    }

    /// Create a migrator over a custom registry.
    pub fn with_registry(db: Arc<Database>, registry: &'static [Migration]) -> Self {
        Self {
            db,
            registry,
            last_backup: Mutex::new(None),
        }
    }

    /// The managed database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The migration registry in use.
    pub fn registry(&self) -> &'static [Migration] {
        self.registry
    }

    /// Create the ledger table and check the registry.
    ///
    /// # Errors
    ///
    /// Returns `InitError` if the ledger cannot be created or the registry is malformed.
    pub fn initialize(&self) -> Result<(), UpdateError> {
        self.db
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS schema_version (
                        version TEXT PRIMARY KEY,
                        description TEXT,
                        applied_at TEXT NOT NULL
                    )",
                )?;
                Ok(())
            })
            .map_err(|e| UpdateError::InitError(format!("cannot create schema ledger: {}", e)))?;

        let problems = validate_registry(self.registry);
        if !problems.is_empty() {
            return Err(UpdateError::InitError(problems.join("; ")));
        }

        info!(
            "Schema migrator ready with {} registered migration(s)",
            self.registry.len()
        );
        Ok(())
    }

    /// Whether every registry entry is well formed.
    pub fn validate_migration_scripts(&self) -> bool {
        let problems = validate_registry(self.registry);
        for problem in &problems {
            error!("Invalid migration: {}", problem);
        }
        problems.is_empty()
    }

    /// Greatest applied version, or `0.0.0` when nothing is applied.
    pub fn current_schema_version(&self) -> Result<Version, UpdateError> {
        let applied = self.applied_versions()?;
        Ok(applied.into_iter().max().unwrap_or_else(zero_version))
    }

    /// Highest registry version not newer than `app_version`.
    pub fn target_schema_version(&self, app_version: &Version) -> Version {
        self.registry
            .iter()
            .filter_map(Migration::parsed_version)
            .filter(|v| v <= app_version)
            .max()
            .unwrap_or_else(zero_version)
    }

    /// Registry entries with `from < version <= to`, ascending.
    pub fn migrations_to_apply(&self, from: &Version, to: &Version) -> Vec<Migration> {
        let mut selected: Vec<(Version, Migration)> = self
            .registry
            .iter()
            .filter_map(|m| m.parsed_version().map(|v| (v, *m)))
            .filter(|(v, _)| v > from && v <= to)
            .collect();
        selected.sort_by(|a, b| a.0.cmp(&b.0));
        selected.into_iter().map(|(_, m)| m).collect()
    }

    /// Ledger rows ordered by version.
    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, UpdateError> {
        let mut rows = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, COALESCE(description, ''), applied_at FROM schema_version",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(AppliedMigration {
                        version: row.get(0)?,
                        description: row.get(1)?,
                        applied_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.sort_by_key(|r| Version::parse(&r.version).unwrap_or_else(|_| zero_version()));
        Ok(rows)
    }

    fn applied_versions(&self) -> Result<HashSet<Version>, UpdateError> {
        let mut versions = HashSet::new();
        for row in self.applied_migrations()? {
            match Version::parse(&row.version) {
                Ok(v) => {
                    versions.insert(v);
                }
                Err(e) => warn!("Ignoring unparseable ledger version {:?}: {}", row.version, e),
            }
        }
        Ok(versions)
    }

    /// Apply `migrations` in ascending version order.
    ///
    /// Each migration runs in its own transaction covering its `apply` step,
    /// its `validate` check and the ledger insert. Versions already in the
    /// ledger are skipped. The batch stops at the first failure; migrations
    /// committed before it stay applied.
    ///
    /// # Returns
    ///
    /// Versions applied by this call.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` naming the failing version.
    pub fn apply_migrations(&self, migrations: &[Migration]) -> Result<Vec<String>, UpdateError> {
        let mut ordered = Vec::with_capacity(migrations.len());
        for migration in migrations {
            let version = migration
                .parsed_version()
                .ok_or_else(|| UpdateError::MigrationFailed {
                    version: migration.version.to_string(),
                    cause: "invalid version".to_string(),
                })?;
            ordered.push((version, *migration));
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut applied = self.applied_versions()?;
        let mut done = Vec::new();

        for (version, migration) in ordered {
            if applied.contains(&version) {
                debug!("Migration {} already applied, skipping", migration.version);
                continue;
            }

            for dep in migration.dependencies {
                let satisfied = Version::parse(dep).map_or(false, |d| applied.contains(&d));
                if !satisfied {
                    return Err(UpdateError::MigrationFailed {
                        version: migration.version.to_string(),
                        cause: format!("dependency {} is not applied", dep),
                    });
                }
            }

            info!(
                "Applying migration {}: {}",
                migration.version, migration.description
            );
            self.db
                .with_connection(|conn| Ok(run_forward(conn, &migration)))?
                .map_err(|cause| {
                    error!("Migration {} failed: {}", migration.version, cause);
                    UpdateError::MigrationFailed {
                        version: migration.version.to_string(),
                        cause,
                    }
                })?;

            applied.insert(version);
            done.push(migration.version.to_string());
        }

        if !done.is_empty() {
            info!("Applied {} migration(s)", done.len());
        }
        Ok(done)
    }

    /// Revert `migrations` in descending version order, continuing past failures.
    pub fn rollback_migrations(&self, migrations: &[Migration]) -> Result<RollbackReport, UpdateError> {
        let mut ordered: Vec<(Version, Migration)> = migrations
            .iter()
            .map(|m| (m.parsed_version().unwrap_or_else(zero_version), *m))
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        let mut report = RollbackReport::default();
        for (_, migration) in ordered {
            let version = migration.version.to_string();
            if migration.revert.is_none() {
                warn!("Migration {} has no revert step", version);
            }

            let outcome = self
                .db
                .with_connection(|conn| Ok(run_reverse(conn, &migration)))?;
            match outcome {
                Ok(()) if migration.revert.is_some() => {
                    info!("Reverted migration {}", version);
                    report.reverted.push(version);
                }
                Ok(()) => report.skipped.push(version),
                Err(cause) => {
                    error!("Reverting migration {} failed: {}", version, cause);
                    report.failed.push((version, cause));
                }
            }
        }
        Ok(report)
    }

    /// Path of the most recent backup made by this migrator.
    pub fn last_backup(&self) -> Option<PathBuf> {
        self.last_backup.lock().ok().and_then(|b| b.clone())
    }

    /// Copy the database file to a new timestamped sibling.
    ///
    /// The connection is closed for the duration of the copy.
    pub fn create_backup(&self) -> Result<PathBuf, UpdateError> {
        let backup = self.db.with_exclusive(|live| {
            let target = next_backup_path(live);
            std::fs::copy(live, &target)?;
            Ok(target)
        })?;

        info!("Created database backup {:?}", backup);
        if let Ok(mut last) = self.last_backup.lock() {
            *last = Some(backup.clone());
        }
        Ok(backup)
    }

    /// Copy a backup over the live database.
    ///
    /// The live file is first saved as another backup. `None` restores the
    /// last backup made by this migrator.
    ///
    /// # Returns
    ///
    /// The backup that was restored.
    ///
    /// # Errors
    ///
    /// Returns `NoBackupAvailable` if there is nothing to restore.
    pub fn restore_from_backup(&self, backup: Option<&Path>) -> Result<PathBuf, UpdateError> {
        let source = backup
            .map(Path::to_path_buf)
            .or_else(|| self.last_backup())
            .ok_or(UpdateError::NoBackupAvailable)?;
        if !source.is_file() {
            return Err(UpdateError::NoBackupAvailable);
        }

        self.db.with_exclusive(|live| {
            if live.exists() {
                let snapshot = next_backup_path(live);
                std::fs::copy(live, &snapshot)?;
                debug!("Saved pre-restore snapshot {:?}", snapshot);
            }
            std::fs::copy(&source, live)?;
            Ok(())
        })?;

        info!("Restored database from {:?}", source);
        Ok(source)
    }

    /// Whether a backup opens as a store database. Never fails.
    pub fn verify_backup(&self, backup: Option<&Path>) -> bool {
        let Some(path) = backup.map(Path::to_path_buf).or_else(|| self.last_backup()) else {
            return false;
        };
        if !path.is_file() {
            return false;
        }

        let check = || -> rusqlite::Result<bool> {
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for name in names {
                if KNOWN_TABLES.contains(&name?.as_str()) {
                    return Ok(true);
                }
            }
            Ok(false)
        };

        match check() {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Backup {:?} failed verification: {}", path, e);
                false
            }
        }
    }

    /// Backups of the managed database, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, UpdateError> {
        list_backups_for(self.db.path())
    }

    /// Delete all but the `max_backups` newest backups. Returns how many were removed.
    pub fn cleanup_old_backups(&self, max_backups: usize) -> Result<usize, UpdateError> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for old in backups.iter().skip(max_backups) {
            match std::fs::remove_file(old) {
                Ok(()) => {
                    debug!("Removed old backup {:?}", old);
                    removed += 1;
                }
                Err(e) => warn!("Could not remove backup {:?}: {}", old, e),
            }
        }
        if removed > 0 {
            info!("Pruned {} old backup(s)", removed);
        }
        Ok(removed)
    }

    /// Whether `PRAGMA integrity_check` reports `ok`.
    pub fn validate_database_integrity(&self) -> bool {
        let result = self.db.with_connection(|conn| {
            Ok(conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))?)
        });
        match result {
            Ok(status) if status == "ok" => true,
            Ok(status) => {
                warn!("Integrity check reported: {}", status);
                false
            }
            Err(e) => {
                warn!("Integrity check failed: {}", e);
                false
            }
        }
    }
}

fn run_forward(conn: &Connection, migration: &Migration) -> Result<(), String> {
    let step = || -> rusqlite::Result<bool> {
        let tx = conn.unchecked_transaction()?;
        (migration.apply)(&tx)?;
        if !(migration.validate)(&tx)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(true)
    };

    match step() {
        Ok(true) => Ok(()),
        Ok(false) => Err("validation failed after apply".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn run_reverse(conn: &Connection, migration: &Migration) -> Result<(), String> {
    let step = || -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        if let Some(revert) = migration.revert {
            revert(&tx)?;
        }
        tx.execute(
            "DELETE FROM schema_version WHERE version = ?1",
            params![migration.version],
        )?;
        tx.commit()
    };
    step().map_err(|e| e.to_string())
}

/// Fresh backup path for `live`, unique among existing siblings.
fn next_backup_path(live: &Path) -> PathBuf {
    let mut stamp = Utc::now();
    loop {
        let candidate = backup_path(live, &stamp.format(BACKUP_TIMESTAMP_FORMAT).to_string());
        if !candidate.exists() {
            return candidate;
        }
        stamp += ChronoDuration::microseconds(1);
    }
}

fn backup_path(live: &Path, stamp: &str) -> PathBuf {
    let name = live
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store.db".to_string());
    live.with_file_name(format!("{}{}{}", name, BACKUP_MARKER, stamp))
}

/// Backups next to `live`, newest first.
pub fn list_backups_for(live: &Path) -> Result<Vec<PathBuf>, UpdateError> {
    let dir = match live.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = match live.file_name() {
        Some(name) => format!("{}{}", name.to_string_lossy(), BACKUP_MARKER),
        None => return Ok(Vec::new()),
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stamp) = name.strip_prefix(&prefix) {
            if entry.file_type()?.is_file() {
                backups.push((stamp.to_string(), entry.path()));
            }
        }
    }
    backups.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(backups.into_iter().map(|(_, p)| p).collect())
}
