//! Property-based tests for pks-updater.
//!
//! # Properties Tested
//!
//! - Release tags parse to the same version with or without a `v` prefix
//! - Update availability matches semantic version ordering
//! - Stored tokens are returned unchanged
//! - Archive entries never resolve outside the destination
//! - Migration selection is ascending and bounded

#![cfg(test)]

use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;
use semver::Version;
use tempfile::TempDir;

use crate::credential::SecureCredentialStore;
use crate::database::Database;
use crate::error::UpdateError;
use crate::manager::is_update_available;
use crate::migrate::SchemaMigrator;
use crate::migrations::{Migration, MIGRATIONS};
use crate::registry::parse_release_version;
use crate::transfer::archive::resolve_entry_path;
use crate::transfer::progress::percentage;

// =============================================================================
// Generators
// =============================================================================

fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..20, 0u64..20, 0u64..20).prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

/// Classic personal access token: `ghp_` plus 36 alphanumerics.
fn arb_token() -> impl Strategy<Value = String> {
    "[A-Za-z0-9]{36}".prop_map(|body| format!("ghp_{}", body))
}

/// Relative path made only of plain segments.
fn arb_safe_entry() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9_]{1,8}(\\.[a-z]{1,3})?", 1..5).prop_map(|parts| parts.join("/"))
}

// =============================================================================
// Versions
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_tag_prefix_is_ignored(version in arb_version()) {
        let plain = parse_release_version(&version.to_string()).unwrap();
        let lower = parse_release_version(&format!("v{}", version)).unwrap();
        let upper = parse_release_version(&format!("V{}", version)).unwrap();
        prop_assert_eq!(&plain, &version);
        prop_assert_eq!(&lower, &version);
        prop_assert_eq!(&upper, &version);
    }

    #[test]
    fn prop_update_available_iff_newer(current in arb_version(), latest in arb_version()) {
        let expected = (latest.major, latest.minor, latest.patch)
            > (current.major, current.minor, current.patch);
        prop_assert_eq!(is_update_available(&current, &latest), expected);
        // Never both directions
        prop_assert!(!(is_update_available(&current, &latest) && is_update_available(&latest, &current)));
    }

    #[test]
    fn prop_percentage_bounded(downloaded in 0u64..10_000_000, total in 0u64..10_000_000) {
        let pct = percentage(downloaded, total);
        prop_assert!((0.0..=100.0).contains(&pct));
        if total == 0 {
            prop_assert_eq!(pct, 0.0);
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_token_round_trip(token in arb_token()) {
        prop_assert!(SecureCredentialStore::validate_format(&token));

        let temp = TempDir::new().unwrap();
        let store = SecureCredentialStore::new(
            temp.path().join("secure-tokens.dat"),
            temp.path().join("encryption.key"),
        );
        store.store(&token).unwrap();
        prop_assert_eq!(store.retrieve().unwrap(), Some(token.clone()));

        // Record must not contain the plaintext
        let record = std::fs::read(temp.path().join("secure-tokens.dat")).unwrap();
        let needle = token.as_bytes();
        prop_assert!(!record.windows(needle.len()).any(|w| w == needle));
    }
}

// =============================================================================
// Archive paths
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_safe_entries_stay_inside(entry in arb_safe_entry()) {
        let dest = Path::new("/srv/staging");
        let resolved = resolve_entry_path(dest, &entry).unwrap();
        prop_assert!(resolved.starts_with(dest));
    }

    #[test]
    fn prop_escaping_entries_rejected(depth in 1usize..5, tail in arb_safe_entry()) {
        let dest = Path::new("/srv/staging");
        let entry = format!("{}{}", "../".repeat(depth), tail);
        let result = resolve_entry_path(dest, &entry);
        prop_assert!(matches!(result, Err(UpdateError::PathTraversal(_))));
    }
}

// =============================================================================
// Migration selection
// =============================================================================

fn noop(_: &rusqlite::Connection) -> rusqlite::Result<()> {
    Ok(())
}

fn yes(_: &rusqlite::Connection) -> rusqlite::Result<bool> {
    Ok(true)
}

const fn entry(version: &'static str) -> Migration {
    Migration {
        version,
        description: "test step",
        dependencies: &[],
        apply: noop,
        revert: None,
        validate: yes,
    }
}

static WIDE_REGISTRY: &[Migration] = &[
    entry("0.1.0"),
    entry("0.2.0"),
    entry("0.2.5"),
    entry("1.0.0"),
    entry("1.0.1"),
    entry("1.0.2"),
    entry("1.3.0"),
    entry("2.0.0"),
    entry("3.1.4"),
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_migrations_to_apply_bounded_and_sorted(
        from in (0u64..4, 0u64..4, 0u64..6).prop_map(|(a, b, c)| Version::new(a, b, c)),
        to in (0u64..4, 0u64..4, 0u64..6).prop_map(|(a, b, c)| Version::new(a, b, c)),
    ) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(temp.path().join("store.db")).unwrap());
        let migrator = SchemaMigrator::with_registry(db, WIDE_REGISTRY);

        let selected = migrator.migrations_to_apply(&from, &to);
        let versions: Vec<Version> = selected.iter().map(|m| m.parsed_version().unwrap()).collect();

        for v in &versions {
            prop_assert!(*v > from && *v <= to);
        }
        for pair in versions.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        let expected = WIDE_REGISTRY
            .iter()
            .filter_map(Migration::parsed_version)
            .filter(|v| *v > from && *v <= to)
            .count();
        prop_assert_eq!(versions.len(), expected);
    }

    #[test]
    fn prop_target_never_exceeds_app_version(app in arb_version()) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::open(temp.path().join("store.db")).unwrap());
        let migrator = SchemaMigrator::new(db);

        let target = migrator.target_schema_version(&app);
        prop_assert!(target <= app);
        prop_assert!(MIGRATIONS.iter().any(|m| m.version == target.to_string()) || target == Version::new(0, 0, 0));
    }
}
