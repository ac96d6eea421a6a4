//! Compiled-in schema migrations for the store database.
//!
//! Entries are listed in ascending version order. Every `apply` must tolerate
//! being run against a schema that already has its change (for example after
//! a restore of a partially migrated file).

use rusqlite::Connection;
use semver::Version;

/// Forward, reverse or validation step of a migration.
pub type MigrationStep = fn(&Connection) -> rusqlite::Result<()>;

/// Post-apply check; `false` fails the migration.
pub type MigrationCheck = fn(&Connection) -> rusqlite::Result<bool>;

/// One schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    /// Versions that must be applied first
    pub dependencies: &'static [&'static str],
    pub apply: MigrationStep,
    pub revert: Option<MigrationStep>,
    pub validate: MigrationCheck,
}

impl Migration {
    /// Parsed version. Registry entries are checked by [`validate_registry`].
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(self.version).ok()
    }
}

/// The migration registry.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: "1.0.1",
        description: "Add remark column to sales",
        dependencies: &[],
        apply: add_sales_remark,
        revert: Some(drop_sales_remark),
        validate: sales_has_remark,
    },
    Migration {
        version: "1.0.2",
        description: "Add cost_price column to products",
        dependencies: &["1.0.1"],
        apply: add_products_cost_price,
        revert: Some(drop_products_cost_price),
        validate: products_has_cost_price,
    },
];

fn add_sales_remark(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "sales", "remark", "TEXT")
}

fn drop_sales_remark(conn: &Connection) -> rusqlite::Result<()> {
    drop_column(conn, "sales", "remark")
}

fn sales_has_remark(conn: &Connection) -> rusqlite::Result<bool> {
    has_column(conn, "sales", "remark")
}

fn add_products_cost_price(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "products", "cost_price", "REAL DEFAULT 0")
}

fn drop_products_cost_price(conn: &Connection) -> rusqlite::Result<()> {
    drop_column(conn, "products", "cost_price")
}

fn products_has_cost_price(conn: &Connection) -> rusqlite::Result<bool> {
    has_column(conn, "products", "cost_price")
}

/// `ALTER TABLE .. ADD COLUMN`, treating an existing column as done.
fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl);
    match conn.execute_batch(&sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn drop_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<()> {
    if !has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {} DROP COLUMN {}", table, column))
}

/// Whether `table` has `column`, per `PRAGMA table_info`.
pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Check a registry for malformed or misordered entries.
///
/// # Returns
///
/// One message per problem; empty when the registry is sound.
pub fn validate_registry(registry: &[Migration]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut previous: Option<Version> = None;

    for (index, migration) in registry.iter().enumerate() {
        let version = match Version::parse(migration.version) {
            Ok(v) => v,
            Err(e) => {
                problems.push(format!(
                    "migration #{} has invalid version {:?}: {}",
                    index, migration.version, e
                ));
                continue;
            }
        };
        if !version.pre.is_empty() || !version.build.is_empty() {
            problems.push(format!(
                "migration {} must be a plain MAJOR.MINOR.PATCH version",
                migration.version
            ));
        }
        if migration.description.trim().is_empty() {
            problems.push(format!("migration {} has no description", migration.version));
        }
        if let Some(prev) = &previous {
            if version <= *prev {
                problems.push(format!(
                    "migration {} is not strictly after {}",
                    migration.version, prev
                ));
            }
        }
        for dep in migration.dependencies {
            let known = registry[..index].iter().any(|m| m.version == *dep);
            if !known {
                problems.push(format!(
                    "migration {} depends on {} which is not an earlier entry",
                    migration.version, dep
                ));
            }
        }
        previous = Some(version);
    }

    problems
}
