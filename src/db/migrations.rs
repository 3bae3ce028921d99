//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and applies sequential,
//! additive-only migrations up to [`CURRENT_SCHEMA_VERSION`]. Migrations add
//! columns with nullable/default semantics or create tables; nothing is ever
//! dropped or rewritten destructively.

use rusqlite::Connection;

use crate::error::Result;

/// The schema version this binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Read the stored schema version (0 when unset).
pub fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

/// Read an arbitrary schema_meta value.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let value = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Write an arbitrary schema_meta value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Run any pending migrations in sequence, each inside a transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(
        schema_version = version,
        target = CURRENT_SCHEMA_VERSION,
        "checking migrations"
    );

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        let tx = conn.transaction()?;
        match next {
            1 => migrate_to_v1(&tx)?,
            2 => migrate_to_v2(&tx)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }
        set_schema_version(&tx, next)?;
        tx.commit()?;
        tracing::info!(from = version, to = next, "migration applied");
        version = next;
    }

    Ok(())
}

/// v1: stamp creation metadata.
fn migrate_to_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('created_by', 'memctl')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('created_at', datetime('now'))",
        [],
    )?;
    Ok(())
}

/// v2: extend corpus_hashes with mount-sync columns on databases created
/// before the mount registry existed.
fn migrate_to_v2(conn: &Connection) -> Result<()> {
    for col_def in [
        "mount_id TEXT",
        "rel_path TEXT",
        "ext TEXT",
        "size_bytes INTEGER",
        "mtime_epoch INTEGER",
        "lang_hint TEXT",
    ] {
        // Tolerate "duplicate column" — column already present on fresh DDL
        let sql = format!("ALTER TABLE corpus_hashes ADD COLUMN {col_def}");
        if let Err(e) = conn.execute(&sql, []) {
            let msg = e.to_string();
            if !msg.contains("duplicate column") {
                return Err(e.into());
            }
        }
    }
    Ok(())
}
