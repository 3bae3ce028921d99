//! SQLite database initialization: WAL mode, schema, migrations, and the
//! open-time integrity check.

pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;

use crate::error::{MemctlError, Result};

/// Open (or create) the memctl database at the given path with schema
/// initialized and migrations applied.
///
/// WAL mode lets concurrent readers proceed while a single writer holds the
/// write lock. `busy_timeout` absorbs short cross-process contention before
/// the store-level bounded retry kicks in.
pub fn open_database(path: impl AsRef<Path>, wal_mode: bool) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut conn = Connection::open(path)?;

    if wal_mode {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn)?;
    migrations::run_migrations(&mut conn)?;

    // Corruption detected at open time is fatal: callers exit 2.
    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        return Err(MemctlError::Fatal(format!(
            "database integrity check failed: {integrity}"
        )));
    }

    tracing::debug!(path = %path.display(), "database ready");
    Ok(conn)
}

/// Open an in-memory database for testing.
pub fn open_memory_database() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn)?;
    migrations::run_migrations(&mut conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested/deeper/memory.db");
        let conn = open_database(&db_path, true).unwrap();
        assert!(db_path.exists());
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn memory_database_has_schema() {
        let conn = open_memory_database().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
