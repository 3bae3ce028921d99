//! The SQLite-backed memory store.
//!
//! Single connection, single writer. Every mutation runs inside one explicit
//! transaction and emits an audit event in the same transaction. Readers
//! receive owned copies of rows; the store exclusively owns all data.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::db::{self, migrations, schema};
use crate::error::{MemctlError, Result};
use crate::memory::types::{
    generate_id, now_iso, CorpusFile, EventAction, MemoryEvent, MemoryItem, MemoryLink,
    MemoryTier, MemoryType, MountRecord, Provenance, SearchMeta,
};

/// Filters shared by list and search operations.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub tier: Option<MemoryTier>,
    pub type_filter: Option<MemoryType>,
    pub scope: Option<String>,
    pub include_archived: bool,
}

/// Summary statistics for `memctl stats`.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_items: u64,
    pub by_tier: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub events_count: u64,
    pub mounts_count: u64,
    pub corpus_files: u64,
    pub fts5_available: bool,
    pub fts_tokenizer: Option<String>,
    pub fts_tokenizer_stored: Option<String>,
    pub fts_indexed_at: Option<String>,
    pub fts_reindex_count: u64,
    pub fts_tokenizer_mismatch: bool,
}

/// Per-table row counts from an administrative reset.
#[derive(Debug, Serialize)]
pub struct ResetReport {
    pub dry_run: bool,
    pub cleared: BTreeMap<String, u64>,
}

pub struct MemoryStore {
    pub(crate) conn: Connection,
    pub(crate) fts_enabled: bool,
    pub(crate) tokenizer: String,
    pub(crate) last_search_meta: Option<SearchMeta>,
}

impl MemoryStore {
    /// Open a disk-backed store with the given FTS tokenizer.
    ///
    /// A tokenizer mismatch against the stored index surfaces a warning but
    /// does not fail the open; `rebuild_fts` recreates the index.
    pub fn open(path: impl AsRef<Path>, wal_mode: bool, tokenizer: &str) -> Result<Self> {
        let conn = db::open_database(path, wal_mode)?;
        Self::finish_open(conn, tokenizer)
    }

    /// In-memory store for tests and ephemeral use.
    pub fn open_in_memory(tokenizer: &str) -> Result<Self> {
        let conn = db::open_memory_database()?;
        Self::finish_open(conn, tokenizer)
    }

    fn finish_open(conn: Connection, tokenizer: &str) -> Result<Self> {
        let tokenizer = schema::validate_fts_tokenizer(tokenizer)?.to_string();

        let fts_existed = schema::fts_table_tokenizer(&conn)?.is_some();
        if let Some(existing) = schema::fts_table_tokenizer(&conn)? {
            if existing != tokenizer {
                tracing::warn!(
                    existing = %existing,
                    configured = %tokenizer,
                    "FTS tokenizer mismatch — run `memctl reindex` to rebuild the index"
                );
            }
        }

        let fts_enabled = schema::init_fts5(&conn, &tokenizer)?;

        // Persist tokenizer metadata only on fresh index creation, so a
        // mismatched open does not clobber the stored value.
        if fts_enabled && !fts_existed {
            migrations::set_meta(&conn, "fts_tokenizer", &tokenizer)?;
            migrations::set_meta(&conn, "fts_indexed_at", &now_iso())?;
        }

        Ok(Self {
            conn,
            fts_enabled,
            tokenizer,
            last_search_meta: None,
        })
    }

    /// True when the active tokenizer stems (prefix expansion is redundant).
    pub fn is_stemming_tokenizer(&self) -> bool {
        self.tokenizer.to_lowercase().contains("porter")
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    pub fn tokenizer(&self) -> &str {
        &self.tokenizer
    }

    /// Metadata for the most recent `search_fulltext` call.
    pub fn last_search_meta(&self) -> Option<&SearchMeta> {
        self.last_search_meta.as_ref()
    }

    /// Run a write op with bounded backoff on lock contention (3 attempts).
    fn with_write_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            match op(&mut self.conn) {
                Err(e) if e.is_transient() && attempt < 2 => {
                    attempt += 1;
                    tracing::debug!(attempt, "store contention, retrying");
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }

    // -- Write path ---------------------------------------------------------

    /// Insert or update an item. Appends a revision, refreshes the FTS row
    /// (via triggers), and emits a `write` event — all in one transaction.
    ///
    /// Fails with an integrity error when a different non-archived item with
    /// the same content hash already exists in the same scope. Returns the
    /// revision id.
    pub fn write_item(&mut self, item: &mut MemoryItem, reason: &str) -> Result<String> {
        item.updated_at = now_iso();
        item.tags = item.normalized_tags();
        let hash = item.content_hash();
        let snapshot_item = item.clone();
        let reason = reason.to_string();

        self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;

            if !snapshot_item.archived {
                let duplicate: Option<String> = tx
                    .query_row(
                        "SELECT id FROM memory_items \
                         WHERE content_hash = ?1 AND scope = ?2 AND archived = 0 AND id != ?3",
                        params![hash, snapshot_item.scope, snapshot_item.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(dup) = duplicate {
                    return Err(MemctlError::Integrity(format!(
                        "duplicate content in scope {:?}: existing item {dup}",
                        snapshot_item.scope
                    )));
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO memory_items \
                 (id, tier, type, title, content, tags, scope, provenance_json, \
                  injectable, archived, superseded_by, usage_count, content_hash, \
                  created_at, updated_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    snapshot_item.id,
                    snapshot_item.tier.as_str(),
                    snapshot_item.item_type.as_str(),
                    snapshot_item.title,
                    snapshot_item.content,
                    serde_json::to_string(&snapshot_item.tags)?,
                    snapshot_item.scope,
                    serde_json::to_string(&snapshot_item.provenance)?,
                    snapshot_item.injectable as i64,
                    snapshot_item.archived as i64,
                    snapshot_item.superseded_by,
                    snapshot_item.usage_count as i64,
                    hash,
                    snapshot_item.created_at,
                    snapshot_item.updated_at,
                ],
            )?;

            let revision_id = generate_id("REV");
            let next_num: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(revision_num), 0) + 1 FROM memory_revisions WHERE item_id = ?1",
                    params![snapshot_item.id],
                    |row| row.get(0),
                )?;
            tx.execute(
                "INSERT INTO memory_revisions \
                 (revision_id, item_id, revision_num, snapshot, changed_at, reason) \
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    revision_id,
                    snapshot_item.id,
                    next_num,
                    serde_json::to_string(&snapshot_item)?,
                    now_iso(),
                    reason,
                ],
            )?;

            log_event_tx(
                &tx,
                EventAction::Write,
                Some(&snapshot_item.id),
                serde_json::json!({ "reason": reason.clone() }),
                &hash,
            )?;

            tx.commit()?;
            Ok(revision_id)
        })
    }

    /// Single lookup. `touch_usage` opts into incrementing `usage_count` and
    /// emitting a `read` event (off by default for internal callers).
    pub fn read_item(&mut self, item_id: &str, touch_usage: bool) -> Result<Option<MemoryItem>> {
        let item = self
            .conn
            .query_row(
                "SELECT * FROM memory_items WHERE id = ?1",
                params![item_id],
                row_to_item,
            )
            .optional()?;

        if let Some(ref found) = item {
            if touch_usage {
                let id = found.id.clone();
                self.with_write_retry(move |conn| {
                    let tx = conn.transaction()?;
                    tx.execute(
                        "UPDATE memory_items SET usage_count = usage_count + 1, updated_at = ?1 \
                         WHERE id = ?2",
                        params![now_iso(), id],
                    )?;
                    log_event_tx(&tx, EventAction::Read, Some(&id), serde_json::json!({}), "")?;
                    tx.commit()?;
                    Ok(())
                })?;
            }
        }
        Ok(item)
    }

    pub fn read_items(&mut self, ids: &[String]) -> Result<Vec<MemoryItem>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.read_item(id, false)? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Patch an existing item through a closure. Id and created_at are
    /// restored after the patch runs; a new revision is appended.
    pub fn update_item(
        &mut self,
        item_id: &str,
        patch: impl FnOnce(&mut MemoryItem),
    ) -> Result<Option<MemoryItem>> {
        let Some(mut item) = self.read_item(item_id, false)? else {
            return Ok(None);
        };
        let id = item.id.clone();
        let created_at = item.created_at.clone();
        patch(&mut item);
        item.id = id;
        item.created_at = created_at;
        self.write_item(&mut item, "update")?;
        Ok(Some(item))
    }

    /// Soft-delete: mark archived, emit an `archive` event. Items are never
    /// physically removed outside `reset`.
    pub fn archive_item(&mut self, item_id: &str) -> Result<bool> {
        let updated = self.update_item(item_id, |item| item.archived = true)?;
        if updated.is_some() {
            self.log_event(
                EventAction::Archive,
                Some(item_id),
                serde_json::json!({}),
                "",
            )?;
        }
        Ok(updated.is_some())
    }

    /// Mark `old_id` as superseded by `new_id` and archive it.
    pub fn supersede_item(&mut self, old_id: &str, new_id: &str) -> Result<bool> {
        let new_owned = new_id.to_string();
        let updated = self.update_item(old_id, move |item| {
            item.archived = true;
            item.superseded_by = Some(new_owned);
        })?;
        Ok(updated.is_some())
    }

    // -- Listing ------------------------------------------------------------

    pub fn list_items(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<MemoryItem>> {
        let (where_clause, params_vec) = filter_clause(filter);
        let sql = format!(
            "SELECT * FROM memory_items WHERE {where_clause} \
             ORDER BY updated_at DESC, id DESC LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut bound: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let limit = limit as i64;
        bound.push(&limit);
        let items = stmt
            .query_map(bound.as_slice(), row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn count_items(&self, filter: &ItemFilter) -> Result<u64> {
        let (where_clause, params_vec) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM memory_items WHERE {where_clause}");
        let bound: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let count: i64 = self.conn.query_row(&sql, bound.as_slice(), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Search by tag overlap (any match, case-insensitive). Tag matching
    /// happens in Rust — SQLite JSON1 availability varies.
    pub fn search_by_tags(
        &self,
        tags: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let candidates = self.list_items(filter, 10_000)?;
        let wanted: std::collections::HashSet<String> =
            tags.iter().map(|t| t.to_lowercase()).collect();
        Ok(candidates
            .into_iter()
            .filter(|item| {
                item.tags
                    .iter()
                    .any(|t| wanted.contains(&t.to_lowercase()))
            })
            .take(limit)
            .collect())
    }

    // -- FTS rebuild ----------------------------------------------------------

    /// Drop and repopulate the FTS index, optionally switching tokenizer.
    /// Updates tokenizer metadata and emits a `reindex` event. Returns
    /// (items indexed, elapsed).
    pub fn rebuild_fts(&mut self, tokenizer: Option<&str>) -> Result<(u64, Duration)> {
        let started = Instant::now();

        if let Some(requested) = tokenizer {
            let new_tok = schema::validate_fts_tokenizer(requested)?.to_string();
            if new_tok != self.tokenizer {
                tracing::info!(from = %self.tokenizer, to = %new_tok, "FTS tokenizer change");
                schema::drop_fts5(&self.conn)?;
                self.tokenizer = new_tok;
                self.fts_enabled = schema::init_fts5(&self.conn, &self.tokenizer)?;
            }
        }

        if !self.fts_enabled {
            return Err(MemctlError::Validation(
                "FTS5 is not available in this SQLite build".into(),
            ));
        }

        let tokenizer = self.tokenizer.clone();
        let count = self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO memory_items_fts(memory_items_fts) VALUES ('rebuild')",
                [],
            )?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0))?;

            migrations::set_meta(&tx, "fts_tokenizer", &tokenizer)?;
            migrations::set_meta(&tx, "fts_indexed_at", &now_iso())?;
            let reindex_count: u64 = migrations::get_meta(&tx, "fts_reindex_count")?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            migrations::set_meta(&tx, "fts_reindex_count", &(reindex_count + 1).to_string())?;

            log_event_tx(
                &tx,
                EventAction::Reindex,
                None,
                serde_json::json!({ "tokenizer": tokenizer.clone(), "items": count }),
                "",
            )?;
            tx.commit()?;
            Ok(count as u64)
        })?;

        let elapsed = started.elapsed();
        tracing::info!(items = count, ?elapsed, tokenizer = %self.tokenizer, "FTS index rebuilt");
        Ok((count, elapsed))
    }

    // -- Events ---------------------------------------------------------------

    pub(crate) fn log_event(
        &mut self,
        action: EventAction,
        item_id: Option<&str>,
        detail: serde_json::Value,
        content_hash: &str,
    ) -> Result<()> {
        let item_id = item_id.map(str::to_string);
        let content_hash = content_hash.to_string();
        self.with_write_retry(move |conn| {
            log_event_conn(conn, action, item_id.as_deref(), detail.clone(), &content_hash)
        })
    }

    pub fn read_events(
        &self,
        item_id: Option<&str>,
        action: Option<EventAction>,
        limit: usize,
    ) -> Result<Vec<MemoryEvent>> {
        let mut conditions = vec!["1=1".to_string()];
        let mut bound: Vec<String> = Vec::new();
        if let Some(id) = item_id {
            conditions.push("item_id = ?".into());
            bound.push(id.to_string());
        }
        if let Some(a) = action {
            conditions.push("action = ?".into());
            bound.push(a.as_str().to_string());
        }
        let sql = format!(
            "SELECT id, action, item_id, details_json, content_hash, timestamp \
             FROM memory_events WHERE {} ORDER BY timestamp DESC, id DESC LIMIT {limit}",
            conditions.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            bound.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let events = stmt
            .query_map(refs.as_slice(), |row| {
                let action_str: String = row.get(1)?;
                let details: String = row.get(3)?;
                Ok(MemoryEvent {
                    id: row.get(0)?,
                    action: action_str
                        .parse()
                        .unwrap_or(EventAction::Write),
                    item_id: row.get(2)?,
                    detail: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                    content_hash: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Timestamp of the most recent event, optionally filtered by action.
    pub fn last_event(&self, actions: &[EventAction]) -> Result<Option<String>> {
        let sql = if actions.is_empty() {
            "SELECT timestamp FROM memory_events ORDER BY timestamp DESC LIMIT 1".to_string()
        } else {
            let placeholders: Vec<String> =
                actions.iter().map(|a| format!("'{}'", a.as_str())).collect();
            format!(
                "SELECT timestamp FROM memory_events WHERE action IN ({}) \
                 ORDER BY timestamp DESC LIMIT 1",
                placeholders.join(",")
            )
        };
        let ts = self.conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        Ok(ts)
    }

    // -- Links ----------------------------------------------------------------

    pub fn write_link(&mut self, link: &MemoryLink) -> Result<()> {
        let link = link.clone();
        self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO memory_links (src_id, dst_id, rel, created_at) \
                 VALUES (?1,?2,?3,?4)",
                params![link.src_id, link.dst_id, link.rel.as_str(), link.created_at],
            )?;
            log_event_tx(
                &tx,
                EventAction::Link,
                Some(&link.src_id),
                serde_json::json!({ "dst_id": link.dst_id.clone(), "rel": link.rel.as_str() }),
                "",
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn read_links(&self, item_id: &str) -> Result<Vec<MemoryLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT src_id, dst_id, rel, created_at FROM memory_links \
             WHERE src_id = ?1 OR dst_id = ?1",
        )?;
        let links = stmt
            .query_map(params![item_id], |row| {
                let rel: String = row.get(2)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, rel, row.get::<_, String>(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(src_id, dst_id, rel, created_at)| {
                rel.parse().ok().map(|rel| MemoryLink {
                    src_id,
                    dst_id,
                    rel,
                    created_at,
                })
            })
            .collect();
        Ok(links)
    }

    // -- Revisions ------------------------------------------------------------

    /// Full revision chain for an item, oldest first.
    pub fn read_revisions(&self, item_id: &str) -> Result<Vec<(u64, String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT revision_num, snapshot, changed_at, reason FROM memory_revisions \
             WHERE item_id = ?1 ORDER BY revision_num",
        )?;
        let revisions = stmt
            .query_map(params![item_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(revisions)
    }

    // -- Corpus hashes ---------------------------------------------------------

    pub fn write_corpus_hash(&mut self, file: &CorpusFile) -> Result<()> {
        let file = file.clone();
        self.with_write_retry(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO corpus_hashes \
                 (file_path, sha256, chunk_count, item_ids, ingested_at, \
                  mount_id, rel_path, ext, size_bytes, mtime_epoch, lang_hint) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    file.file_path,
                    file.sha256,
                    file.chunk_count as i64,
                    serde_json::to_string(&file.item_ids)?,
                    file.ingested_at,
                    file.mount_id,
                    file.rel_path,
                    file.ext,
                    file.size_bytes.map(|v| v as i64),
                    file.mtime_epoch,
                    file.lang_hint,
                ],
            )?;
            Ok(())
        })
    }

    pub fn read_corpus_hash(&self, file_path: &str) -> Result<Option<CorpusFile>> {
        let file = self
            .conn
            .query_row(
                "SELECT * FROM corpus_hashes WHERE file_path = ?1",
                params![file_path],
                row_to_corpus_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn remove_corpus_hash(&mut self, file_path: &str) -> Result<bool> {
        let file_path = file_path.to_string();
        self.with_write_retry(move |conn| {
            let rows = conn.execute(
                "DELETE FROM corpus_hashes WHERE file_path = ?1",
                params![file_path],
            )?;
            Ok(rows > 0)
        })
    }

    /// List corpus files, optionally filtered by mount.
    pub fn list_corpus_files(&self, mount_id: Option<&str>) -> Result<Vec<CorpusFile>> {
        let (sql, bound): (&str, Vec<String>) = match mount_id {
            Some(id) => (
                "SELECT * FROM corpus_hashes WHERE mount_id = ? ORDER BY file_path",
                vec![id.to_string()],
            ),
            None => ("SELECT * FROM corpus_hashes ORDER BY file_path", vec![]),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            bound.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let files = stmt
            .query_map(refs.as_slice(), row_to_corpus_file)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    // -- Mounts ----------------------------------------------------------------

    /// Register a folder mount. Idempotent on canonical path: re-registering
    /// returns the existing id.
    pub fn write_mount(
        &mut self,
        path: &str,
        name: Option<&str>,
        ignore_patterns: &[String],
        lang_hint: Option<&str>,
    ) -> Result<String> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT mount_id FROM memory_mounts WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let mount_id = generate_id("MNT");
        let path = path.to_string();
        let name = name.map(str::to_string);
        let ignore_json = serde_json::to_string(ignore_patterns)?;
        let lang_hint = lang_hint.map(str::to_string);
        let id_for_insert = mount_id.clone();
        self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO memory_mounts \
                 (mount_id, path, name, ignore_json, lang_hint, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![id_for_insert, path, name, ignore_json, lang_hint, now_iso()],
            )?;
            log_event_tx(
                &tx,
                EventAction::MountRegister,
                None,
                serde_json::json!({ "mount_id": id_for_insert.clone(), "path": path.clone() }),
                "",
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(mount_id)
    }

    /// Look up a mount by id, canonical path, or display name.
    pub fn read_mount(&self, key: &str) -> Result<Option<MountRecord>> {
        let mount = self
            .conn
            .query_row(
                "SELECT * FROM memory_mounts WHERE mount_id = ?1 OR path = ?1 OR name = ?1",
                params![key],
                row_to_mount,
            )
            .optional()?;
        Ok(mount)
    }

    pub fn list_mounts(&self) -> Result<Vec<MountRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM memory_mounts ORDER BY created_at")?;
        let mounts = stmt
            .query_map([], row_to_mount)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(mounts)
    }

    pub fn remove_mount(&mut self, key: &str) -> Result<bool> {
        let Some(mount) = self.read_mount(key)? else {
            return Ok(false);
        };
        let mount_id = mount.mount_id;
        self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM memory_mounts WHERE mount_id = ?1",
                params![mount_id],
            )?;
            log_event_tx(
                &tx,
                EventAction::MountRemove,
                None,
                serde_json::json!({ "mount_id": mount_id.clone() }),
                "",
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(true)
    }

    pub fn touch_mount_sync_time(&mut self, mount_id: &str) -> Result<()> {
        let mount_id = mount_id.to_string();
        self.with_write_retry(move |conn| {
            conn.execute(
                "UPDATE memory_mounts SET last_sync_at = ?1 WHERE mount_id = ?2",
                params![now_iso(), mount_id],
            )?;
            Ok(())
        })
    }

    // -- Stats & reset ----------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let total_items: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_items WHERE archived = 0",
            [],
            |r| r.get(0),
        )?;
        let mut by_tier = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT tier, COUNT(*) FROM memory_items WHERE archived = 0 GROUP BY tier",
        )?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (tier, count) = row?;
            by_tier.insert(tier, count as u64);
        }
        let mut by_type = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT type, COUNT(*) FROM memory_items WHERE archived = 0 GROUP BY type",
        )?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (ty, count) = row?;
            by_type.insert(ty, count as u64);
        }
        let events_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM memory_events", [], |r| r.get(0))?;
        let mounts_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM memory_mounts", [], |r| r.get(0))?;
        let corpus_files: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM corpus_hashes", [], |r| r.get(0))?;

        let stored_tok = migrations::get_meta(&self.conn, "fts_tokenizer")?;
        let mismatch = self.fts_enabled
            && stored_tok
                .as_deref()
                .map(|s| s != self.tokenizer)
                .unwrap_or(false);

        Ok(StoreStats {
            total_items: total_items as u64,
            by_tier,
            by_type,
            events_count: events_count as u64,
            mounts_count: mounts_count as u64,
            corpus_files: corpus_files as u64,
            fts5_available: self.fts_enabled,
            fts_tokenizer: self.fts_enabled.then(|| self.tokenizer.clone()),
            fts_tokenizer_stored: stored_tok,
            fts_indexed_at: migrations::get_meta(&self.conn, "fts_indexed_at")?,
            fts_reindex_count: migrations::get_meta(&self.conn, "fts_reindex_count")?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            fts_tokenizer_mismatch: mismatch,
        })
    }

    /// Administrative reset: truncate content tables in one transaction.
    /// `schema_meta` is never cleared. The FTS index empties through the
    /// BEFORE DELETE trigger on memory_items.
    pub fn reset(&mut self, preserve_mounts: bool, dry_run: bool) -> Result<ResetReport> {
        let mut tables = vec![
            "memory_items",
            "memory_revisions",
            "memory_events",
            "memory_links",
            "corpus_hashes",
        ];
        if !preserve_mounts {
            tables.push("memory_mounts");
        }

        if dry_run {
            let mut cleared = BTreeMap::new();
            for table in &tables {
                let count: i64 =
                    self.conn
                        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
                cleared.insert(table.to_string(), count as u64);
            }
            return Ok(ResetReport {
                dry_run: true,
                cleared,
            });
        }

        self.with_write_retry(move |conn| {
            let tx = conn.transaction()?;
            let mut cleared = BTreeMap::new();
            for table in &tables {
                let count: i64 =
                    tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
                cleared.insert(table.to_string(), count as u64);
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            // The reset event is written after memory_events is cleared, so
            // it survives as the first row of the new log.
            log_event_tx(
                &tx,
                EventAction::Reset,
                None,
                serde_json::json!({
                    "preserve_mounts": preserve_mounts,
                    "tables_cleared": tables.len(),
                }),
                "",
            )?;
            tx.commit()?;
            Ok(ResetReport {
                dry_run: false,
                cleared,
            })
        })
    }
}

// -- Row mapping and shared helpers ------------------------------------------

fn filter_clause(filter: &ItemFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut bound = Vec::new();
    if !filter.include_archived {
        conditions.push("archived = 0".to_string());
    }
    if let Some(tier) = filter.tier {
        conditions.push("tier = ?".to_string());
        bound.push(tier.as_str().to_string());
    }
    if let Some(ty) = filter.type_filter {
        conditions.push("type = ?".to_string());
        bound.push(ty.as_str().to_string());
    }
    if let Some(ref scope) = filter.scope {
        conditions.push("scope = ?".to_string());
        bound.push(scope.clone());
    }
    if conditions.is_empty() {
        conditions.push("1=1".to_string());
    }
    (conditions.join(" AND "), bound)
}

pub(crate) fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let tier: String = row.get("tier")?;
    let item_type: String = row.get("type")?;
    let tags: String = row.get("tags")?;
    let provenance: String = row.get("provenance_json")?;
    Ok(MemoryItem {
        id: row.get("id")?,
        tier: tier.parse().unwrap_or(MemoryTier::Stm),
        item_type: MemoryType::from(item_type),
        title: row.get("title")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        scope: row.get("scope")?,
        provenance: serde_json::from_str::<Provenance>(&provenance).unwrap_or_default(),
        injectable: row.get::<_, i64>("injectable")? != 0,
        archived: row.get::<_, i64>("archived")? != 0,
        superseded_by: row.get("superseded_by")?,
        usage_count: row.get::<_, i64>("usage_count")? as u64,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_corpus_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<CorpusFile> {
    let item_ids: String = row.get("item_ids")?;
    Ok(CorpusFile {
        file_path: row.get("file_path")?,
        sha256: row.get("sha256")?,
        chunk_count: row.get::<_, i64>("chunk_count")? as u64,
        item_ids: serde_json::from_str(&item_ids).unwrap_or_default(),
        ingested_at: row.get("ingested_at")?,
        mount_id: row.get("mount_id")?,
        rel_path: row.get("rel_path")?,
        ext: row.get("ext")?,
        size_bytes: row.get::<_, Option<i64>>("size_bytes")?.map(|v| v as u64),
        mtime_epoch: row.get("mtime_epoch")?,
        lang_hint: row.get("lang_hint")?,
    })
}

fn row_to_mount(row: &rusqlite::Row<'_>) -> rusqlite::Result<MountRecord> {
    let ignore_json: String = row.get("ignore_json")?;
    Ok(MountRecord {
        mount_id: row.get("mount_id")?,
        path: row.get("path")?,
        name: row.get("name")?,
        ignore_patterns: serde_json::from_str(&ignore_json).unwrap_or_default(),
        lang_hint: row.get("lang_hint")?,
        created_at: row.get("created_at")?,
        last_sync_at: row.get("last_sync_at")?,
    })
}

/// Write an audit event on a transaction (mutation paths).
pub(crate) fn log_event_tx(
    tx: &rusqlite::Transaction<'_>,
    action: EventAction,
    item_id: Option<&str>,
    detail: serde_json::Value,
    content_hash: &str,
) -> Result<()> {
    log_event_conn(tx, action, item_id, detail, content_hash)
}

fn log_event_conn(
    conn: &Connection,
    action: EventAction,
    item_id: Option<&str>,
    detail: serde_json::Value,
    content_hash: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_events (id, action, item_id, details_json, content_hash, timestamp) \
         VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            generate_id("EVT"),
            action.as_str(),
            item_id,
            detail.to_string(),
            content_hash,
            now_iso(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap()
    }

    fn sample_item(content: &str) -> MemoryItem {
        let mut item = MemoryItem::new("sample", content);
        item.provenance.source_id = "test".into();
        item
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = test_store();
        let mut item = sample_item("round trip content");
        item.tags = vec!["Alpha".into(), "alpha".into(), "beta".into()];
        store.write_item(&mut item, "create").unwrap();

        let read = store.read_item(&item.id, false).unwrap().unwrap();
        assert_eq!(read.content, "round trip content");
        assert_eq!(read.content_hash(), item.content_hash());
        // Tags normalized at write time
        assert_eq!(read.tags, vec!["alpha", "beta"]);
    }

    #[test]
    fn write_emits_event_and_revision() {
        let mut store = test_store();
        let mut item = sample_item("audited content");
        store.write_item(&mut item, "create").unwrap();

        let events = store.read_events(Some(&item.id), Some(EventAction::Write), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content_hash, item.content_hash());

        let revisions = store.read_revisions(&item.id).unwrap();
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].0, 1);
    }

    #[test]
    fn duplicate_content_in_scope_is_integrity_error() {
        let mut store = test_store();
        let mut first = sample_item("identical content");
        store.write_item(&mut first, "create").unwrap();

        let mut second = sample_item("identical content");
        let err = store.write_item(&mut second, "create").unwrap_err();
        assert!(matches!(err, MemctlError::Integrity(_)));

        // Same content in a different scope is fine
        let mut third = sample_item("identical content");
        third.scope = "other".into();
        store.write_item(&mut third, "create").unwrap();
    }

    #[test]
    fn archived_duplicate_does_not_block() {
        let mut store = test_store();
        let mut first = sample_item("dup content");
        store.write_item(&mut first, "create").unwrap();
        store.archive_item(&first.id).unwrap();

        let mut second = sample_item("dup content");
        store.write_item(&mut second, "create").unwrap();
    }

    #[test]
    fn read_touch_increments_usage() {
        let mut store = test_store();
        let mut item = sample_item("counted");
        store.write_item(&mut item, "create").unwrap();

        store.read_item(&item.id, false).unwrap();
        assert_eq!(store.read_item(&item.id, false).unwrap().unwrap().usage_count, 0);

        store.read_item(&item.id, true).unwrap();
        assert_eq!(store.read_item(&item.id, false).unwrap().unwrap().usage_count, 1);
    }

    #[test]
    fn update_preserves_id_and_created_at() {
        let mut store = test_store();
        let mut item = sample_item("before");
        store.write_item(&mut item, "create").unwrap();
        let created = item.created_at.clone();

        let updated = store
            .update_item(&item.id, |it| {
                it.content = "after".into();
                it.created_at = "1999-01-01T00:00:00Z".into(); // ignored
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.content, "after");
        assert_eq!(updated.created_at, created);
        assert_eq!(store.read_revisions(&item.id).unwrap().len(), 2);
    }

    #[test]
    fn supersede_archives_and_points() {
        let mut store = test_store();
        let mut old = sample_item("old fact");
        let mut new = sample_item("new fact");
        store.write_item(&mut old, "create").unwrap();
        store.write_item(&mut new, "create").unwrap();

        assert!(store.supersede_item(&old.id, &new.id).unwrap());
        let read = store.read_item(&old.id, false).unwrap().unwrap();
        assert!(read.archived);
        assert_eq!(read.superseded_by.as_deref(), Some(new.id.as_str()));
    }

    #[test]
    fn list_filters_archived_by_default() {
        let mut store = test_store();
        let mut live = sample_item("live");
        let mut gone = sample_item("gone");
        store.write_item(&mut live, "create").unwrap();
        store.write_item(&mut gone, "create").unwrap();
        store.archive_item(&gone.id).unwrap();

        let items = store.list_items(&ItemFilter::default(), 100).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, live.id);

        let all = store
            .list_items(
                &ItemFilter {
                    include_archived: true,
                    ..Default::default()
                },
                100,
            )
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn tag_search_is_case_insensitive() {
        let mut store = test_store();
        let mut item = sample_item("tagged");
        item.tags = vec!["SQLite".into()];
        store.write_item(&mut item, "create").unwrap();

        let hits = store
            .search_by_tags(&["sqlite".to_string()], &ItemFilter::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = store
            .search_by_tags(&["postgres".to_string()], &ItemFilter::default(), 10)
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn links_round_trip() {
        let mut store = test_store();
        let link = MemoryLink::new("MEM-a", "MEM-b", crate::memory::types::LinkRel::Supersedes);
        store.write_link(&link).unwrap();
        let links = store.read_links("MEM-a").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].dst_id, "MEM-b");
        // Visible from the destination too
        assert_eq!(store.read_links("MEM-b").unwrap().len(), 1);
    }

    #[test]
    fn mounts_are_idempotent_by_path() {
        let mut store = test_store();
        let first = store.write_mount("/tmp/corpus", Some("corpus"), &[], None).unwrap();
        let second = store.write_mount("/tmp/corpus", None, &[], None).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_mounts().unwrap().len(), 1);
        // Lookup by name works
        assert!(store.read_mount("corpus").unwrap().is_some());
        assert!(store.remove_mount(&first).unwrap());
        assert!(store.read_mount("/tmp/corpus").unwrap().is_none());
    }

    #[test]
    fn rebuild_fts_counts_and_logs() {
        let mut store = test_store();
        let mut item = sample_item("indexable content here");
        store.write_item(&mut item, "create").unwrap();

        let (count, _elapsed) = store.rebuild_fts(None).unwrap();
        assert_eq!(count, 1);
        let events = store.read_events(None, Some(EventAction::Reindex), 10).unwrap();
        assert_eq!(events.len(), 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.fts_reindex_count, 1);
    }

    #[test]
    fn rebuild_with_new_tokenizer_switches() {
        let mut store = test_store();
        let mut item = sample_item("stemming monitored monitoring");
        store.write_item(&mut item, "create").unwrap();

        store.rebuild_fts(Some("porter unicode61 remove_diacritics 2")).unwrap();
        assert!(store.is_stemming_tokenizer());
        assert_eq!(
            migrations::get_meta(&store.conn, "fts_tokenizer").unwrap().as_deref(),
            Some("porter unicode61 remove_diacritics 2")
        );
    }

    #[test]
    fn reset_preserves_schema_meta_and_mounts() {
        let mut store = test_store();
        let mut item = sample_item("to be cleared");
        store.write_item(&mut item, "create").unwrap();
        store.write_mount("/tmp/m", None, &[], None).unwrap();

        let dry = store.reset(true, true).unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.cleared["memory_items"], 1);
        // Dry run deleted nothing
        assert_eq!(store.count_items(&ItemFilter::default()).unwrap(), 1);

        let report = store.reset(true, false).unwrap();
        assert!(!report.dry_run);
        assert_eq!(store.count_items(&ItemFilter::default()).unwrap(), 0);
        assert_eq!(store.list_mounts().unwrap().len(), 1);
        // schema_meta survived
        assert_eq!(
            migrations::get_schema_version(&store.conn).unwrap(),
            migrations::CURRENT_SCHEMA_VERSION
        );
        // The reset event is the sole survivor in the log
        let events = store.read_events(None, Some(EventAction::Reset), 10).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn stats_reflect_contents() {
        let mut store = test_store();
        let mut a = sample_item("alpha");
        a.tier = MemoryTier::Ltm;
        a.item_type = MemoryType::Decision;
        let mut b = sample_item("beta");
        store.write_item(&mut a, "create").unwrap();
        store.write_item(&mut b, "create").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.by_tier["ltm"], 1);
        assert_eq!(stats.by_tier["stm"], 1);
        assert_eq!(stats.by_type["decision"], 1);
        assert!(stats.fts5_available);
        assert!(!stats.fts_tokenizer_mismatch);
    }
}
