//! SQL DDL for all memctl tables.
//!
//! Defines `memory_items`, `memory_revisions`, `memory_events`,
//! `memory_links`, `corpus_hashes`, `memory_mounts`, `schema_meta`, and the
//! `memory_items_fts` FTS5 virtual table with its sync triggers. All DDL
//! uses `IF NOT EXISTS` for idempotent initialization. Tables that memctl
//! does not know about are left untouched.

use regex::Regex;
use rusqlite::Connection;
use std::sync::LazyLock;

use crate::error::{MemctlError, Result};

const SCHEMA_SQL: &str = r#"
-- Canonical memory items (current state)
CREATE TABLE IF NOT EXISTS memory_items (
    id              TEXT PRIMARY KEY,
    tier            TEXT NOT NULL CHECK(tier IN ('stm','mtm','ltm')),
    type            TEXT NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    content         TEXT NOT NULL DEFAULT '',
    tags            TEXT NOT NULL DEFAULT '[]',
    scope           TEXT NOT NULL DEFAULT 'project',
    provenance_json TEXT NOT NULL DEFAULT '{}',
    injectable      INTEGER NOT NULL DEFAULT 1,
    archived        INTEGER NOT NULL DEFAULT 0,
    superseded_by   TEXT,
    usage_count     INTEGER NOT NULL DEFAULT 0,
    content_hash    TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- Full revision history (append-only)
CREATE TABLE IF NOT EXISTS memory_revisions (
    revision_id  TEXT PRIMARY KEY,
    item_id      TEXT NOT NULL,
    revision_num INTEGER NOT NULL,
    snapshot     TEXT NOT NULL,
    changed_at   TEXT NOT NULL,
    reason       TEXT NOT NULL DEFAULT 'update'
);

-- Audit log (append-only; rows are never mutated)
CREATE TABLE IF NOT EXISTS memory_events (
    id            TEXT PRIMARY KEY,
    action        TEXT NOT NULL,
    item_id       TEXT,
    details_json  TEXT NOT NULL DEFAULT '{}',
    content_hash  TEXT NOT NULL DEFAULT '',
    timestamp     TEXT NOT NULL
);

-- Typed relationships between items
CREATE TABLE IF NOT EXISTS memory_links (
    src_id     TEXT NOT NULL,
    dst_id     TEXT NOT NULL,
    rel        TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (src_id, dst_id, rel)
);

-- Content-addressed registry of ingested files
CREATE TABLE IF NOT EXISTS corpus_hashes (
    file_path   TEXT PRIMARY KEY,
    sha256      TEXT NOT NULL,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    item_ids    TEXT NOT NULL DEFAULT '[]',
    ingested_at TEXT NOT NULL,
    mount_id    TEXT,
    rel_path    TEXT,
    ext         TEXT,
    size_bytes  INTEGER,
    mtime_epoch INTEGER,
    lang_hint   TEXT
);

-- Mount registry for folder-level sync
CREATE TABLE IF NOT EXISTS memory_mounts (
    mount_id     TEXT PRIMARY KEY,
    path         TEXT NOT NULL UNIQUE,
    name         TEXT,
    ignore_json  TEXT NOT NULL DEFAULT '[]',
    lang_hint    TEXT,
    created_at   TEXT NOT NULL,
    last_sync_at TEXT
);

-- Schema metadata for forward compatibility
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_tier ON memory_items(tier);
CREATE INDEX IF NOT EXISTS idx_items_type ON memory_items(type);
CREATE INDEX IF NOT EXISTS idx_items_scope ON memory_items(scope);
CREATE INDEX IF NOT EXISTS idx_items_archived ON memory_items(archived);
CREATE INDEX IF NOT EXISTS idx_items_content_hash ON memory_items(content_hash);
CREATE INDEX IF NOT EXISTS idx_revisions_item ON memory_revisions(item_id);
CREATE INDEX IF NOT EXISTS idx_events_action ON memory_events(action);
CREATE INDEX IF NOT EXISTS idx_events_item ON memory_events(item_id);
CREATE INDEX IF NOT EXISTS idx_corpus_mount ON corpus_hashes(mount_id);
"#;

/// Conservative whitelist for FTS5 tokenizer strings. Rejects quotes,
/// semicolons, parentheses — a tokenizer string is interpolated into DDL.
static FTS_TOKENIZER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_ .\-]+$").unwrap());

/// Validate a tokenizer string against the whitelist.
pub fn validate_fts_tokenizer(tokenizer: &str) -> Result<&str> {
    let trimmed = tokenizer.trim();
    if trimmed.is_empty() {
        return Err(MemctlError::Validation(
            "FTS5 tokenizer string cannot be empty".into(),
        ));
    }
    if !FTS_TOKENIZER_PATTERN.is_match(trimmed) {
        return Err(MemctlError::Validation(format!(
            "unsafe FTS5 tokenizer string {trimmed:?} — only [a-zA-Z0-9_ .-] allowed"
        )));
    }
    Ok(trimmed)
}

/// FTS5 external-content schema with sync triggers.
///
/// INSERT OR REPLACE fires DELETE then INSERT, so the BEFORE DELETE and
/// AFTER INSERT triggers together cover that case.
fn fts5_schema_sql(tokenizer: &str) -> Result<String> {
    let safe = validate_fts_tokenizer(tokenizer)?;
    Ok(format!(
        r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_items_fts USING fts5(
    title, content, tags,
    content='memory_items',
    content_rowid='rowid',
    tokenize='{safe}'
);

CREATE TRIGGER IF NOT EXISTS memory_items_fts_ai
AFTER INSERT ON memory_items BEGIN
    INSERT INTO memory_items_fts(rowid, title, content, tags)
    VALUES (new.rowid, new.title, new.content, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS memory_items_fts_bd
BEFORE DELETE ON memory_items BEGIN
    INSERT INTO memory_items_fts(memory_items_fts, rowid, title, content, tags)
    VALUES ('delete', old.rowid, old.title, old.content, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS memory_items_fts_bu
BEFORE UPDATE ON memory_items BEGIN
    INSERT INTO memory_items_fts(memory_items_fts, rowid, title, content, tags)
    VALUES ('delete', old.rowid, old.title, old.content, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS memory_items_fts_au
AFTER UPDATE ON memory_items BEGIN
    INSERT INTO memory_items_fts(rowid, title, content, tags)
    VALUES (new.rowid, new.title, new.content, new.tags);
END;
"#
    ))
}

/// Initialize all base tables. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Create the FTS5 virtual table and triggers with the given tokenizer.
/// Returns false (without error) when the SQLite build lacks FTS5 — callers
/// fall back to LIKE search.
pub fn init_fts5(conn: &Connection, tokenizer: &str) -> Result<bool> {
    let sql = fts5_schema_sql(tokenizer)?;
    match conn.execute_batch(&sql) {
        Ok(()) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such module") => {
            tracing::info!("FTS5 unavailable, falling back to LIKE search");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Drop the FTS table and its triggers (tokenizer change path).
pub fn drop_fts5(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
DROP TABLE IF EXISTS memory_items_fts;
DROP TRIGGER IF EXISTS memory_items_fts_ai;
DROP TRIGGER IF EXISTS memory_items_fts_bd;
DROP TRIGGER IF EXISTS memory_items_fts_bu;
DROP TRIGGER IF EXISTS memory_items_fts_au;
"#,
    )?;
    Ok(())
}

/// Read the tokenizer recorded in the FTS table's own DDL, if present.
pub fn fts_table_tokenizer(conn: &Connection) -> Result<Option<String>> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name='memory_items_fts'",
            [],
            |row| row.get(0),
        )
        .ok();
    static TOKENIZE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"tokenize='([^']*)'").unwrap());
    Ok(sql.and_then(|s| {
        TOKENIZE_RE
            .captures(&s)
            .map(|c| c.get(1).unwrap().as_str().trim().to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "memory_items",
            "memory_revisions",
            "memory_events",
            "memory_links",
            "corpus_hashes",
            "memory_mounts",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn fts5_triggers_track_inserts() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert!(init_fts5(&conn, "unicode61 remove_diacritics 2").unwrap());

        conn.execute(
            "INSERT INTO memory_items (id, tier, type, title, content, created_at, updated_at) \
             VALUES ('MEM-1', 'stm', 'note', 'Quantum title', 'entangled content', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_items_fts WHERE memory_items_fts MATCH 'quantum'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn tokenizer_whitelist() {
        assert!(validate_fts_tokenizer("unicode61 remove_diacritics 2").is_ok());
        assert!(validate_fts_tokenizer("porter").is_ok());
        assert!(validate_fts_tokenizer("").is_err());
        assert!(validate_fts_tokenizer("unicode61'; DROP TABLE x--").is_err());
        assert!(validate_fts_tokenizer("tok(enizer)").is_err());
    }

    #[test]
    fn fts_table_tokenizer_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_fts5(&conn, "porter unicode61 remove_diacritics 2").unwrap();
        assert_eq!(
            fts_table_tokenizer(&conn).unwrap().as_deref(),
            Some("porter unicode61 remove_diacritics 2")
        );
    }
}
