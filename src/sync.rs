//! Folder scanning and delta synchronization.
//!
//! The 3-tier delta rule, per file:
//!   A. not in `corpus_hashes` → ingest
//!   B. stored size and mtime both match → skip without reading
//!   C. metadata differs → hash; same hash → metadata refresh only,
//!      different → re-ingest (replacing the prior item set)
//!
//! Files present in `corpus_hashes` but absent on disk have their items
//! archived — never deleted.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::extract::{extension_of, is_ingestable, ExtractorRegistry};
use crate::ingest::{ingest_file, IngestOptions};
use crate::memory::store::MemoryStore;
use crate::memory::types::{now_iso, MountRecord};
use crate::mount::register_mount;
use crate::policy::MemoryPolicy;

/// Metadata for one scanned file. SHA-256 is computed lazily — only when
/// the delta rule needs it.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub ext: String,
    pub size_bytes: u64,
    pub mtime_epoch: i64,
}

/// Result of scanning a mount folder (stat only, no hashing).
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

/// Counters from syncing one mount.
#[derive(Debug, Default, Serialize)]
pub struct SyncResult {
    pub mount_path: String,
    pub files_scanned: usize,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub files_orphaned: usize,
    pub chunks_created: usize,
}

/// Glob-style ignore matching against the relative path and the basename.
fn is_ignored(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let matcher = glob::Pattern::new(pattern).ok();
        let Some(matcher) = matcher else {
            return false;
        };
        if matcher.matches(rel_path) {
            return true;
        }
        Path::new(rel_path)
            .file_name()
            .map(|name| matcher.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    })
}

/// Walk a mount folder collecting metadata for ingestable files.
pub fn scan_mount(mount_path: &Path, ignore_patterns: &[String]) -> Result<ScanResult> {
    let mut result = ScanResult::default();

    for entry in walkdir::WalkDir::new(mount_path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let abs_path = entry.into_path();
        let rel_path = abs_path
            .strip_prefix(mount_path)
            .unwrap_or(&abs_path)
            .to_string_lossy()
            .to_string();

        if is_ignored(&rel_path, ignore_patterns) || !is_ingestable(&abs_path) {
            continue;
        }

        // Transient: a file may vanish between enumeration and stat.
        let metadata = match std::fs::metadata(&abs_path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %abs_path.display(), error = %e, "cannot stat, skipping");
                continue;
            }
        };

        result.total_size += metadata.len();
        result.files.push(FileInfo {
            ext: extension_of(&abs_path),
            rel_path,
            size_bytes: metadata.len(),
            mtime_epoch: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            abs_path,
        });
    }

    Ok(result)
}

/// Staleness pre-check: compare (rel_path, size, mtime) triples on disk
/// against the stored inventory. O(n) stat calls, no hashing.
pub fn is_stale(store: &MemoryStore, mount: &MountRecord) -> Result<bool> {
    if mount.last_sync_at.is_none() {
        return Ok(true);
    }

    let scan = scan_mount(Path::new(&mount.path), &mount.ignore_patterns)?;
    let disk: HashSet<(String, u64, i64)> = scan
        .files
        .iter()
        .map(|f| (f.rel_path.clone(), f.size_bytes, f.mtime_epoch))
        .collect();

    let stored: HashSet<(String, u64, i64)> = store
        .list_corpus_files(Some(&mount.mount_id))?
        .into_iter()
        .filter_map(|f| match (f.rel_path, f.size_bytes, f.mtime_epoch) {
            (Some(rel), Some(size), Some(mtime)) => Some((rel, size, mtime)),
            _ => None,
        })
        .collect();

    Ok(disk != stored)
}

/// Sync one folder into the store, auto-registering the mount if needed.
pub fn sync_mount(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    extractors: &ExtractorRegistry,
    mount_path: &Path,
    delta: bool,
    ignore_override: Option<&[String]>,
    max_chunk_chars: usize,
) -> Result<SyncResult> {
    let canonical = mount_path
        .canonicalize()
        .unwrap_or_else(|_| mount_path.to_path_buf());

    let mount = match store.read_mount(&canonical.to_string_lossy())? {
        Some(m) => m,
        None => {
            let id = register_mount(store, &canonical, None, ignore_override.unwrap_or(&[]), None)?;
            store.read_mount(&id)?.expect("mount registered above")
        }
    };

    let patterns: Vec<String> = ignore_override
        .map(|p| p.to_vec())
        .unwrap_or_else(|| mount.ignore_patterns.clone());

    let scan = scan_mount(&canonical, &patterns)?;
    let mut result = SyncResult {
        mount_path: canonical.to_string_lossy().to_string(),
        files_scanned: scan.files.len(),
        ..Default::default()
    };

    let mut seen_paths: HashSet<String> = HashSet::new();

    for file in &scan.files {
        let key = file.abs_path.to_string_lossy().to_string();
        seen_paths.insert(key.clone());

        let existing = store.read_corpus_hash(&key)?;

        if delta {
            if let Some(ref stored) = existing {
                // Tier B: metadata match → fast skip.
                if stored.size_bytes == Some(file.size_bytes)
                    && stored.mtime_epoch == Some(file.mtime_epoch)
                {
                    result.files_unchanged += 1;
                    continue;
                }
                // Tier C: hash to confirm.
                let sha256 = hash_file(&file.abs_path)?;
                if stored.sha256 == sha256 {
                    let mut refreshed = stored.clone();
                    refreshed.mount_id = Some(mount.mount_id.clone());
                    refreshed.rel_path = Some(file.rel_path.clone());
                    refreshed.ext = Some(file.ext.clone());
                    refreshed.size_bytes = Some(file.size_bytes);
                    refreshed.mtime_epoch = Some(file.mtime_epoch);
                    refreshed.ingested_at = now_iso();
                    store.write_corpus_hash(&refreshed)?;
                    result.files_unchanged += 1;
                    continue;
                }
                result.files_changed += 1;
            } else {
                // Tier A: unseen file.
                result.files_new += 1;
            }
        } else if existing.is_none() {
            result.files_new += 1;
        } else {
            result.files_changed += 1;
        }

        // ingest_file archives the replaced item set before writing.
        let opts = IngestOptions {
            scope: "project".into(),
            max_chunk_chars,
            auto_format: true,
            injectable: true,
            full: true,
            mount_id: Some(mount.mount_id.clone()),
            rel_path: Some(file.rel_path.clone()),
            lang_hint: mount.lang_hint.clone(),
            ..Default::default()
        };

        match ingest_file(store, policy, extractors, &file.abs_path, &opts) {
            Ok(ingested) => result.chunks_created += ingested.chunks_created,
            Err(e) if e.is_transient() => {
                // Ingest-time transient errors are logged and skipped.
                tracing::warn!(path = %file.abs_path.display(), error = %e, "transient error, skipped");
            }
            Err(e) => return Err(e),
        }
    }

    // Orphans: stored for this mount but gone from disk → archive.
    for stored in store.list_corpus_files(Some(&mount.mount_id))? {
        if seen_paths.contains(&stored.file_path) {
            continue;
        }
        if Path::new(&stored.file_path).exists() {
            continue;
        }
        for item_id in &stored.item_ids {
            store.archive_item(item_id)?;
        }
        store.remove_corpus_hash(&stored.file_path)?;
        result.files_orphaned += 1;
    }

    store.touch_mount_sync_time(&mount.mount_id)?;
    tracing::info!(
        mount = %result.mount_path,
        new = result.files_new,
        changed = result.files_changed,
        unchanged = result.files_unchanged,
        orphaned = result.files_orphaned,
        chunks = result.chunks_created,
        "sync complete"
    );
    Ok(result)
}

/// Sync every registered mount whose path still exists.
pub fn sync_all(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    extractors: &ExtractorRegistry,
    delta: bool,
    max_chunk_chars: usize,
) -> Result<Vec<SyncResult>> {
    let mounts = store.list_mounts()?;
    let mut results = Vec::new();
    for mount in mounts {
        let path = PathBuf::from(&mount.path);
        if !path.is_dir() {
            tracing::warn!(path = %mount.path, "mount path missing, skipping");
            continue;
        }
        results.push(sync_mount(
            store,
            policy,
            extractors,
            &path,
            delta,
            None,
            max_chunk_chars,
        )?);
    }
    Ok(results)
}

fn hash_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
