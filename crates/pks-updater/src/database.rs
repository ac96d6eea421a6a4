//! Owned connection to the primary data store.
//!
//! Callers borrow the live connection through [`Database::with_connection`]
//! instead of holding it, so the handle can be closed and reopened around
//! file-level operations such as backup and restore.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use crate::error::UpdateError;

/// Connection lifecycle for the store database.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, UpdateError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        debug!("Opened database {:?}", path);
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a live connection is held.
    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Run `f` against the live connection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the connection is closed.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        let guard = self.lock()?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(UpdateError::InvalidState("database is closed".to_string())),
        }
    }

    /// Drop the live connection.
    pub fn close(&self) -> Result<(), UpdateError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| UpdateError::Database(e))?;
            debug!("Closed database {:?}", self.path);
        }
        Ok(())
    }

    /// Open a fresh connection, replacing any existing one.
    pub fn reopen(&self) -> Result<(), UpdateError> {
        let mut guard = self.lock()?;
        *guard = Some(Connection::open(&self.path)?);
        debug!("Reopened database {:?}", self.path);
        Ok(())
    }

    /// Run `f` with the connection closed, reopening afterwards even if `f` fails.
    ///
    /// Other callers block on the connection until `f` returns.
    pub fn with_exclusive<T>(
        &self,
        f: impl FnOnce(&Path) -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| UpdateError::Database(e))?;
        }

        let result = f(&self.path);
        *guard = Some(Connection::open(&self.path)?);
        result
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>, UpdateError> {
        self.conn
            .lock()
            .map_err(|_| UpdateError::InvalidState("database lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("store.db");
        let db = Database::open(&path).unwrap();
        assert!(db.is_open());
        assert!(path.exists());
    }

    #[test]
    fn test_closed_connection_rejects_queries() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path().join("store.db")).unwrap();
        db.close().unwrap();
        assert!(!db.is_open());

        let result = db.with_connection(|c| Ok(c.execute("SELECT 1", [])?));
        assert!(matches!(result, Err(UpdateError::InvalidState(_))));

        db.reopen().unwrap();
        let one: i64 = db
            .with_connection(|c| Ok(c.query_row("SELECT 1", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_exclusive_reopens_after_failure() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path().join("store.db")).unwrap();

        let result: Result<(), _> = db.with_exclusive(|_| Err(UpdateError::Cancelled));
        assert!(matches!(result, Err(UpdateError::Cancelled)));
        assert!(db.is_open());
    }

    #[test]
    fn test_exclusive_sees_committed_data() {
        let temp = TempDir::new().unwrap();
        let db = Database::open(temp.path().join("store.db")).unwrap();
        db.with_connection(|c| {
            c.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .unwrap();

        let copy = temp.path().join("copy.db");
        db.with_exclusive(|path| Ok(std::fs::copy(path, &copy)?))
            .unwrap();

        let conn = Connection::open(&copy).unwrap();
        let x: i64 = conn.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
    }
}
