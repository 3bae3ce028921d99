//! Structural corpus digest: deterministic, token-bounded summaries built
//! from corpus metadata alone — no content reads, no LLM calls.
//!
//! Observation rules run against four thresholds whose semantics are
//! frozen: dominance (one folder holds a large share of chunks), low
//! density (chunks-per-file in the bottom decile), extension concentration
//! (one extension holds most chunks), and sparseness (almost no chunks at
//! all). Output paths are always mount-relative.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::InspectConfig;
use crate::error::{MemctlError, Result};
use crate::extract::ExtractorRegistry;
use crate::memory::store::MemoryStore;
use crate::mount::register_mount;
use crate::policy::MemoryPolicy;
use crate::sync::{is_stale, sync_mount};

#[derive(Debug, Default, Serialize, Clone)]
pub struct FolderStats {
    pub file_count: u64,
    pub chunk_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct ExtStats {
    pub file_count: u64,
    pub chunk_count: u64,
    pub size_bytes: u64,
    /// Share of all chunks carried by this extension, in [0, 1].
    pub chunk_frac: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct LargeFile {
    pub path: String,
    pub size_bytes: u64,
    pub chunk_count: u64,
}

/// The structural digest for one mount (or the whole store).
#[derive(Debug, Default, Serialize)]
pub struct InspectStats {
    pub total_files: u64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub per_folder: BTreeMap<String, FolderStats>,
    pub per_extension: BTreeMap<String, ExtStats>,
    pub top_largest: Vec<LargeFile>,
    pub observations: Vec<String>,
    pub thresholds: ObservationThresholds,
}

#[derive(Debug, Serialize, Clone)]
pub struct ObservationThresholds {
    pub dominance_frac: f64,
    pub low_density_threshold: f64,
    pub ext_concentration_frac: f64,
    pub sparse_threshold: u64,
}

impl Default for ObservationThresholds {
    fn default() -> Self {
        let c = InspectConfig::default();
        Self {
            dominance_frac: c.dominance_frac,
            low_density_threshold: c.low_density_threshold,
            ext_concentration_frac: c.ext_concentration_frac,
            sparse_threshold: c.sparse_threshold,
        }
    }
}

impl From<&InspectConfig> for ObservationThresholds {
    fn from(c: &InspectConfig) -> Self {
        Self {
            dominance_frac: c.dominance_frac,
            low_density_threshold: c.low_density_threshold,
            ext_concentration_frac: c.ext_concentration_frac,
            sparse_threshold: c.sparse_threshold,
        }
    }
}

/// Mount-relative path for a corpus file entry. Files ingested without a
/// mount fall back to their basename; absolute paths never leak.
fn safe_rel_path(file_path: &str, rel_path: Option<&str>) -> String {
    if let Some(rel) = rel_path {
        if !rel.is_empty() {
            return rel.to_string();
        }
    }
    Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string())
}

/// Compute the structural digest from `corpus_hashes` rows.
pub fn inspect_stats(
    store: &MemoryStore,
    mount_id: Option<&str>,
    config: &InspectConfig,
) -> Result<InspectStats> {
    let files = store.list_corpus_files(mount_id)?;
    let thresholds = ObservationThresholds::from(config);

    let mut stats = InspectStats {
        thresholds: thresholds.clone(),
        ..Default::default()
    };
    if files.is_empty() {
        return Ok(stats);
    }

    let mut largest: Vec<LargeFile> = Vec::new();

    for file in &files {
        let rel = safe_rel_path(&file.file_path, file.rel_path.as_deref());
        let size = file.size_bytes.unwrap_or(0);
        let folder = Path::new(&rel)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ".".into());

        stats.total_files += 1;
        stats.total_chunks += file.chunk_count;
        stats.total_size += size;

        let folder_entry = stats.per_folder.entry(folder).or_default();
        folder_entry.file_count += 1;
        folder_entry.chunk_count += file.chunk_count;
        folder_entry.size_bytes += size;

        let ext = file.ext.clone().unwrap_or_else(|| {
            Path::new(&file.file_path)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default()
        });
        if !ext.is_empty() {
            let ext_entry = stats.per_extension.entry(ext).or_default();
            ext_entry.file_count += 1;
            ext_entry.chunk_count += file.chunk_count;
            ext_entry.size_bytes += size;
        }

        largest.push(LargeFile {
            path: rel,
            size_bytes: size,
            chunk_count: file.chunk_count,
        });
    }

    for ext_entry in stats.per_extension.values_mut() {
        ext_entry.chunk_frac = if stats.total_chunks > 0 {
            ext_entry.chunk_count as f64 / stats.total_chunks as f64
        } else {
            0.0
        };
    }

    largest.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.path.cmp(&b.path)));
    stats.top_largest = largest.into_iter().take(5).collect();

    stats.observations = compute_observations(&stats, &thresholds);
    Ok(stats)
}

fn compute_observations(stats: &InspectStats, t: &ObservationThresholds) -> Vec<String> {
    let mut obs = Vec::new();
    if stats.total_chunks == 0 || stats.total_files == 0 {
        return obs;
    }

    // Dominance: one folder holds a large share of chunks.
    for (folder, fs) in &stats.per_folder {
        let frac = fs.chunk_count as f64 / stats.total_chunks as f64;
        if frac >= t.dominance_frac {
            obs.push(format!(
                "{folder}/ dominates content ({}% of chunks)",
                (frac * 100.0) as u64
            ));
        }
    }

    // Low density: folders in the bottom decile of chunks-per-file.
    if stats.per_folder.len() >= 3 {
        let mut densities: Vec<(&String, f64, u64)> = stats
            .per_folder
            .iter()
            .filter(|(_, fs)| fs.file_count > 0)
            .map(|(folder, fs)| {
                (folder, fs.chunk_count as f64 / fs.file_count as f64, fs.file_count)
            })
            .collect();
        densities.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let cutoff = ((densities.len() as f64 * t.low_density_threshold) as usize).max(1);
        for (folder, density, file_count) in densities.into_iter().take(cutoff) {
            if file_count >= 3 {
                obs.push(format!(
                    "{folder}/ has low chunk density ({density:.1} chunks/file, {file_count} files)"
                ));
            }
        }
    }

    // Extension concentration: one extension holds most chunks.
    let mut exts: Vec<(&String, &ExtStats)> = stats.per_extension.iter().collect();
    exts.sort_by(|a, b| b.1.chunk_count.cmp(&a.1.chunk_count).then(a.0.cmp(b.0)));
    for (ext, es) in exts {
        if es.chunk_frac >= t.ext_concentration_frac {
            obs.push(format!(
                "{ext} files dominate ({}% of chunks)",
                (es.chunk_frac * 100.0) as u64
            ));
        }
    }

    // Sparseness: folders with almost no chunks despite several files.
    // The file-count gate keeps one-file folders from false-flagging.
    for (folder, fs) in &stats.per_folder {
        if fs.chunk_count <= t.sparse_threshold && fs.file_count >= 3 {
            obs.push(format!(
                "{folder}/ is sparse ({} chunks across {} files)",
                fs.chunk_count, fs.file_count
            ));
        }
    }

    obs
}

fn format_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        "unknown".into()
    } else if size_bytes < 1024 {
        format!("{size_bytes} B")
    } else if size_bytes < 1024 * 1024 {
        format!("{:.1} KB", size_bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", size_bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Render the digest as a token-budgeted injection block. Deterministic:
/// same rows, same output. Budget is enforced by prefix trimming at line
/// granularity.
pub fn format_inspect_block(
    stats: &InspectStats,
    mount_label: Option<&str>,
    budget_tokens: usize,
) -> String {
    if stats.total_files == 0 {
        return "## Structure (Injected)\nNo files found.\n".into();
    }

    let mut lines: Vec<String> = Vec::new();
    lines.push("## Structure (Injected)".into());
    lines.push("format_version: 1".into());
    lines.push("injection_type: structure_inspect".into());
    if let Some(label) = mount_label {
        lines.push(format!("mount: {label}"));
    }
    lines.push(String::new());
    lines.push(format!("Total files: {}", stats.total_files));
    lines.push(format!("Total chunks: {}", stats.total_chunks));
    lines.push(format!("Total size: {}", format_size(stats.total_size)));
    lines.push(String::new());

    if !stats.per_folder.is_empty() {
        lines.push("Folders:".into());
        let mut folders: Vec<(&String, &FolderStats)> = stats.per_folder.iter().collect();
        folders.sort_by(|a, b| b.1.chunk_count.cmp(&a.1.chunk_count).then(a.0.cmp(b.0)));
        for (folder, fs) in folders {
            lines.push(format!(
                "- {folder}/ ({} files, {} chunks, {})",
                fs.file_count,
                fs.chunk_count,
                format_size(fs.size_bytes)
            ));
        }
        lines.push(String::new());
    }

    if !stats.top_largest.is_empty() {
        lines.push("Largest files:".into());
        for f in &stats.top_largest {
            lines.push(format!(
                "- {} ({}, {} chunks)",
                f.path,
                format_size(f.size_bytes),
                f.chunk_count
            ));
        }
        lines.push(String::new());
    }

    if !stats.per_extension.is_empty() {
        lines.push("Extensions:".into());
        let mut exts: Vec<(&String, &ExtStats)> = stats.per_extension.iter().collect();
        exts.sort_by(|a, b| b.1.chunk_count.cmp(&a.1.chunk_count).then(a.0.cmp(b.0)));
        for (ext, es) in exts {
            lines.push(format!(
                "- {ext}: {} files, {}, {}% of chunks",
                es.file_count,
                format_size(es.size_bytes),
                (es.chunk_frac * 100.0) as u64
            ));
        }
        lines.push(String::new());
    }

    if !stats.observations.is_empty() {
        lines.push("Observations:".into());
        for o in &stats.observations {
            lines.push(format!("- {o}"));
        }
        lines.push(String::new());
    }

    let text = lines.join("\n");
    let max_chars = budget_tokens * 4;
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        let cut = truncated.rfind('\n').unwrap_or(truncated.len());
        format!("{}\n[...truncated]\n", &truncated[..cut])
    } else {
        text
    }
}

/// How `inspect`/`ask` decide whether to sync first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for SyncMode {
    type Err = MemctlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            _ => Err(MemctlError::Validation(format!(
                "invalid sync mode {s:?}: expected auto|always|never"
            ))),
        }
    }
}

/// Result of the `inspect_path` orchestration: the digest plus what the
/// orchestrator did on the way (auto-mount, sync).
#[derive(Debug, Serialize)]
pub struct InspectOutcome {
    #[serde(flatten)]
    pub stats: InspectStats,
    pub mount_id: String,
    pub mount_label: String,
    pub was_mounted: bool,
    pub was_synced: bool,
    pub sync_skipped: bool,
    pub sync_files_new: usize,
    pub sync_files_changed: usize,
    pub sync_chunks_created: usize,
}

/// Orchestrate mount + staleness check + sync + digest for a path, so
/// `memctl inspect <dir>` works with no manual steps.
pub fn inspect_path(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    extractors: &ExtractorRegistry,
    path: &Path,
    sync_mode: SyncMode,
    config: &InspectConfig,
    max_chunk_chars: usize,
    log: &mut dyn FnMut(&str),
) -> Result<InspectOutcome> {
    let canonical = path.canonicalize().map_err(|_| {
        MemctlError::Validation(format!("path does not exist: {}", path.display()))
    })?;
    if !canonical.is_dir() {
        return Err(MemctlError::Validation(format!(
            "path is not a directory: {}",
            canonical.display()
        )));
    }

    // Step 1: ensure the path is mounted.
    let mut was_mounted = false;
    let mount = match store.read_mount(&canonical.to_string_lossy())? {
        Some(m) => m,
        None => {
            let id = register_mount(store, &canonical, None, &[], None)?;
            was_mounted = true;
            log(&format!("[inspect] mounted: {}", canonical.display()));
            store.read_mount(&id)?.expect("mount registered above")
        }
    };

    // Step 2: staleness check + sync decision.
    let do_sync = match sync_mode {
        SyncMode::Always => {
            log("[inspect] sync=always");
            true
        }
        SyncMode::Never => {
            log("[inspect] sync=never, skipping");
            false
        }
        SyncMode::Auto => {
            if is_stale(store, &mount)? {
                log("[inspect] store is stale, syncing");
                true
            } else {
                log("[inspect] store is up-to-date");
                false
            }
        }
    };

    // Step 3: sync when needed.
    let (mut was_synced, mut new, mut changed, mut chunks) = (false, 0, 0, 0);
    if do_sync {
        let sr = sync_mount(
            store,
            policy,
            extractors,
            &canonical,
            true,
            None,
            max_chunk_chars,
        )?;
        was_synced = true;
        new = sr.files_new;
        changed = sr.files_changed;
        chunks = sr.chunks_created;
        log(&format!(
            "[inspect] synced: {new} new, {changed} changed, {chunks} chunks"
        ));
    }

    // Step 4: digest.
    let stats = inspect_stats(store, Some(&mount.mount_id), config)?;
    let mount_label = mount
        .name
        .clone()
        .unwrap_or_else(|| canonical.to_string_lossy().to_string());

    Ok(InspectOutcome {
        stats,
        mount_id: mount.mount_id,
        mount_label,
        was_mounted,
        was_synced,
        sync_skipped: !do_sync,
        sync_files_new: new,
        sync_files_changed: changed,
        sync_chunks_created: chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::memory::types::{now_iso, CorpusFile};

    fn seed_corpus_file(
        store: &mut MemoryStore,
        rel: &str,
        chunks: u64,
        size: u64,
        mount_id: Option<&str>,
    ) {
        let ext = Path::new(rel)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        store
            .write_corpus_hash(&CorpusFile {
                file_path: format!("/abs/{rel}"),
                sha256: format!("hash-{rel}"),
                chunk_count: chunks,
                item_ids: vec![],
                ingested_at: now_iso(),
                mount_id: mount_id.map(str::to_string),
                rel_path: Some(rel.to_string()),
                ext: Some(ext),
                size_bytes: Some(size),
                mtime_epoch: Some(0),
                lang_hint: None,
            })
            .unwrap();
    }

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap()
    }

    #[test]
    fn totals_and_folders_aggregate() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "docs/a.md", 4, 100, None);
        seed_corpus_file(&mut store, "docs/b.md", 2, 200, None);
        seed_corpus_file(&mut store, "src/c.rs", 1, 300, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_chunks, 7);
        assert_eq!(stats.total_size, 600);
        assert_eq!(stats.per_folder["docs"].file_count, 2);
        assert_eq!(stats.per_folder["docs"].chunk_count, 6);
        assert_eq!(stats.per_extension[".md"].chunk_count, 6);
        assert!((stats.per_extension[".md"].chunk_frac - 6.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn dominance_observation_fires() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "big/a.md", 8, 100, None);
        seed_corpus_file(&mut store, "small/b.md", 2, 100, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert!(stats
            .observations
            .iter()
            .any(|o| o.starts_with("big/ dominates content (80%")));
    }

    #[test]
    fn ext_concentration_is_over_chunks() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "a.md", 9, 100, None);
        seed_corpus_file(&mut store, "b.rs", 1, 100, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert!(stats
            .observations
            .iter()
            .any(|o| o.contains(".md files dominate (90% of chunks)")));
    }

    #[test]
    fn sparse_observation_is_per_folder_with_file_gate() {
        let mut store = test_store();
        // "empty" holds three files but a single chunk; "full" is healthy.
        seed_corpus_file(&mut store, "empty/a.md", 1, 50, None);
        seed_corpus_file(&mut store, "empty/b.md", 0, 50, None);
        seed_corpus_file(&mut store, "empty/c.md", 0, 50, None);
        seed_corpus_file(&mut store, "full/d.md", 9, 500, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert!(stats
            .observations
            .iter()
            .any(|o| o == "empty/ is sparse (1 chunks across 3 files)"));
        assert!(!stats.observations.iter().any(|o| o.starts_with("full/ is sparse")));
    }

    #[test]
    fn sparse_needs_at_least_three_files() {
        let mut store = test_store();
        // One nearly-empty file alone is not enough signal.
        seed_corpus_file(&mut store, "solo/a.md", 1, 50, None);
        seed_corpus_file(&mut store, "rest/b.md", 8, 500, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert!(!stats.observations.iter().any(|o| o.contains("sparse")));
    }

    #[test]
    fn custom_thresholds_change_observations() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "half/a.md", 5, 100, None);
        seed_corpus_file(&mut store, "other/b.md", 5, 100, None);

        // Default 0.40: both folders hold 50% → both dominate
        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert_eq!(
            stats
                .observations
                .iter()
                .filter(|o| o.contains("dominates"))
                .count(),
            2
        );

        // Raised to 0.6: neither dominates
        let config = InspectConfig {
            dominance_frac: 0.6,
            ..Default::default()
        };
        let stats = inspect_stats(&store, None, &config).unwrap();
        assert!(!stats.observations.iter().any(|o| o.contains("dominates")));
    }

    #[test]
    fn block_paths_are_mount_relative() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "docs/deep/file.md", 3, 5000, None);

        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        let block = format_inspect_block(&stats, Some("corpus"), 2200);
        assert!(block.contains("docs/deep/file.md"));
        assert!(!block.contains("/abs/"));
        assert!(block.contains("format_version: 1"));
        assert!(block.contains("mount: corpus"));
    }

    #[test]
    fn block_respects_budget() {
        let mut store = test_store();
        for i in 0..200 {
            seed_corpus_file(&mut store, &format!("dir{i}/file{i}.md"), 2, 100, None);
        }
        let stats = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        let block = format_inspect_block(&stats, None, 100);
        assert!(block.chars().count() <= 100 * 4 + 20);
        assert!(block.ends_with("[...truncated]\n"));
    }

    #[test]
    fn inspect_block_is_deterministic() {
        let mut store = test_store();
        seed_corpus_file(&mut store, "a/x.md", 2, 10, None);
        seed_corpus_file(&mut store, "b/y.md", 2, 10, None);
        let s1 = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        let s2 = inspect_stats(&store, None, &InspectConfig::default()).unwrap();
        assert_eq!(
            format_inspect_block(&s1, None, 2200),
            format_inspect_block(&s2, None, 2200)
        );
    }

    #[test]
    fn inspect_path_automounts_and_syncs() {
        let mut store = test_store();
        let policy = MemoryPolicy::new(PolicyConfig::default());
        let extractors = ExtractorRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.md"), "hello world").unwrap();

        let mut messages: Vec<String> = Vec::new();
        let outcome = inspect_path(
            &mut store,
            &policy,
            &extractors,
            dir.path(),
            SyncMode::Auto,
            &InspectConfig::default(),
            1800,
            &mut |m| messages.push(m.to_string()),
        )
        .unwrap();

        assert!(outcome.was_mounted);
        assert!(outcome.was_synced);
        assert_eq!(outcome.stats.total_files, 1);

        // Second run: mounted and fresh → no sync
        let outcome2 = inspect_path(
            &mut store,
            &policy,
            &extractors,
            dir.path(),
            SyncMode::Auto,
            &InspectConfig::default(),
            1800,
            &mut |_| {},
        )
        .unwrap();
        assert!(!outcome2.was_mounted);
        assert!(!outcome2.was_synced);
        assert!(outcome2.sync_skipped);
    }
}
