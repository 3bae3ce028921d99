//! File-to-memory chunking pipeline.
//!
//! Splits extracted text at paragraph boundaries into a lazy chunk
//! sequence, infers titles and tags, and routes every chunk through the
//! policy engine as a proposal. Idempotent: re-ingesting an unchanged file
//! is a no-op (dedup via `corpus_hashes`).

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{MemctlError, Result};
use crate::extract::{extension_of, is_ingestable, ExtractorRegistry};
use crate::memory::store::MemoryStore;
use crate::memory::types::{now_iso, CorpusFile, MemoryProposal, MemoryType, Provenance, SourceKind};
use crate::policy::MemoryPolicy;
use crate::proposer::{commit_proposal, CommitOutcome};

/// Default chunk ceiling, leaving headroom under the 2000-char policy cap
/// for the provenance header line.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1800;

/// Summary of an ingest operation.
#[derive(Debug, Default, Serialize)]
pub struct IngestResult {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub chunks_created: usize,
    pub chunks_quarantined: usize,
    pub chunks_rejected: usize,
    pub item_ids: Vec<String>,
}

/// One paragraph-bounded chunk with 0-based line coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

struct Paragraph {
    text: String,
    start_line: usize,
    end_line: usize,
}

/// Lazy chunk sequence over extracted text. Finite, consumed once; callers
/// must not assume it can be re-iterated.
///
/// Adjacent short paragraphs merge up to `max_chars`; a single paragraph
/// over the ceiling is split at line boundaries (and in the degenerate
/// single-long-line case, at a char boundary) so no emitted chunk exceeds
/// the ceiling.
pub struct ParagraphChunks<'a> {
    lines: std::str::Lines<'a>,
    next_line_no: usize,
    pending: VecDeque<Paragraph>,
    max_chars: usize,
    exhausted: bool,
}

impl<'a> ParagraphChunks<'a> {
    pub fn new(text: &'a str, max_chars: usize) -> Self {
        Self {
            lines: text.lines(),
            next_line_no: 0,
            pending: VecDeque::new(),
            max_chars: max_chars.max(1),
            exhausted: false,
        }
    }

    /// Parse the next paragraph from the underlying lines.
    fn parse_paragraph(&mut self) -> Option<Paragraph> {
        let mut collected: Vec<&str> = Vec::new();
        let mut start_line = self.next_line_no;

        loop {
            let Some(line) = self.lines.next() else {
                self.exhausted = true;
                break;
            };
            self.next_line_no += 1;

            if line.trim().is_empty() {
                if collected.is_empty() {
                    start_line = self.next_line_no;
                    continue;
                }
                break;
            }
            collected.push(line);
        }

        if collected.is_empty() {
            return None;
        }
        let end_line = start_line + collected.len() - 1;
        Some(Paragraph {
            text: collected.join("\n"),
            start_line,
            end_line,
        })
    }

    /// Split an oversized paragraph at line boundaries into pieces that fit.
    fn split_oversized(&self, para: Paragraph) -> Vec<Paragraph> {
        let mut pieces = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_chars = 0usize;
        let mut piece_start = para.start_line;
        let mut line_no = para.start_line;

        for line in para.text.lines() {
            let line_chars = line.chars().count();
            if !current.is_empty() && current_chars + 1 + line_chars > self.max_chars {
                pieces.push(Paragraph {
                    text: current.join("\n"),
                    start_line: piece_start,
                    end_line: line_no - 1,
                });
                current = Vec::new();
                current_chars = 0;
                piece_start = line_no;
            }
            if line_chars > self.max_chars {
                // A single line beyond the ceiling: hard-split on chars.
                let chars: Vec<char> = line.chars().collect();
                for slice in chars.chunks(self.max_chars) {
                    pieces.push(Paragraph {
                        text: slice.iter().collect(),
                        start_line: line_no,
                        end_line: line_no,
                    });
                }
            } else {
                current_chars += if current.is_empty() { 0 } else { 1 } + line_chars;
                current.push(line);
            }
            line_no += 1;
        }
        if !current.is_empty() {
            pieces.push(Paragraph {
                text: current.join("\n"),
                start_line: piece_start,
                end_line: para.end_line,
            });
        }
        pieces
    }

    fn take_paragraph(&mut self) -> Option<Paragraph> {
        if let Some(p) = self.pending.pop_front() {
            return Some(p);
        }
        if self.exhausted {
            return None;
        }
        self.parse_paragraph()
    }
}

impl Iterator for ParagraphChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let mut parts: Vec<String> = Vec::new();
        let mut chars = 0usize;
        let mut start_line = 0usize;
        let mut end_line = 0usize;

        loop {
            let Some(para) = self.take_paragraph() else {
                break;
            };
            let para_chars = para.text.chars().count();

            if para_chars > self.max_chars {
                let mut pieces = self.split_oversized(para);
                while let Some(piece) = pieces.pop() {
                    self.pending.push_front(piece);
                }
                continue;
            }

            let joined = chars + if parts.is_empty() { 0 } else { 2 } + para_chars;
            if !parts.is_empty() && joined > self.max_chars {
                self.pending.push_front(para);
                break;
            }

            if parts.is_empty() {
                start_line = para.start_line;
            }
            end_line = para.end_line;
            chars = joined;
            parts.push(para.text);
        }

        if parts.is_empty() {
            None
        } else {
            Some(Chunk {
                text: parts.join("\n\n"),
                start_line,
                end_line,
            })
        }
    }
}

// -- Title and tag inference --------------------------------------------------

/// First markdown heading within the first 20 lines, else the fallback.
pub fn infer_title(text: &str, fallback: &str) -> String {
    for line in text.lines().take(20) {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let title = rest.trim_start_matches('#').trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    fallback.to_string()
}

/// Extension tag plus up to two parent directory names, lowercased and
/// deduplicated.
pub fn infer_tags(path: &Path) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let ext_tag = match extension_of(path).as_str() {
        ".md" => Some("markdown"),
        ".txt" => Some("text"),
        ".rst" => Some("rst"),
        ".py" => Some("python"),
        ".rs" => Some("rust"),
        ".js" => Some("javascript"),
        ".ts" => Some("typescript"),
        ".java" => Some("java"),
        ".go" => Some("go"),
        ".c" | ".h" => Some("c"),
        ".cpp" | ".hpp" => Some("cpp"),
        ".sh" | ".bash" | ".zsh" => Some("shell"),
        ".sql" => Some("sql"),
        ".json" => Some("json"),
        ".yaml" | ".yml" => Some("yaml"),
        ".toml" => Some("toml"),
        ".html" | ".htm" => Some("html"),
        ".xml" => Some("xml"),
        ".csv" => Some("csv"),
        ".pdf" => Some("pdf"),
        ".docx" => Some("docx"),
        _ => None,
    };
    if let Some(tag) = ext_tag {
        tags.push(tag.to_string());
    }

    let parents: Vec<String> = path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(name) => {
                        Some(name.to_string_lossy().to_lowercase().replace(' ', "-"))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    for parent in parents.iter().rev().take(2).rev() {
        if !parent.is_empty() && parent.len() <= 40 && !tags.contains(parent) {
            tags.push(parent.clone());
        }
    }
    tags
}

// -- Source resolution ---------------------------------------------------------

/// Expand source arguments into concrete file paths.
///
/// Each argument may be a file, a directory (walked recursively for
/// ingestable extensions), or a glob pattern. Duplicates collapse,
/// preserving first-seen order; missing literal paths are a validation
/// error.
pub fn resolve_sources(raw: &[String]) -> Result<Vec<PathBuf>> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    let mut push = |path: PathBuf, result: &mut Vec<PathBuf>| {
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone());
        if seen.insert(canonical) {
            result.push(path);
        }
    };

    for arg in raw {
        if arg.contains('*') || arg.contains('?') {
            let mut matches: Vec<PathBuf> = glob::glob(arg)
                .map_err(|e| MemctlError::Validation(format!("bad glob pattern {arg:?}: {e}")))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            matches.sort();
            for m in matches {
                push(m, &mut result);
            }
            continue;
        }

        let path = PathBuf::from(arg);
        if path.is_dir() {
            let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| is_ingestable(p))
                .collect();
            files.sort();
            for f in files {
                push(f, &mut result);
            }
            continue;
        }

        if !path.is_file() {
            return Err(MemctlError::Validation(format!(
                "source not found: {arg:?} — pass a file, directory, or glob pattern"
            )));
        }
        push(path, &mut result);
    }

    Ok(result)
}

// -- Ingest -------------------------------------------------------------------

/// Knobs for one ingest call.
pub struct IngestOptions {
    pub scope: String,
    pub max_chunk_chars: usize,
    pub extra_tags: Vec<String>,
    /// Infer title/tags from path and headings.
    pub auto_format: bool,
    pub injectable: bool,
    /// Re-ingest even when the stored hash matches.
    pub full: bool,
    pub mount_id: Option<String>,
    pub rel_path: Option<String>,
    pub lang_hint: Option<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            scope: "project".into(),
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            extra_tags: Vec::new(),
            auto_format: true,
            injectable: true,
            full: false,
            mount_id: None,
            rel_path: None,
            lang_hint: None,
        }
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn text_sha256(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Ingest a single file. Idempotent via `corpus_hashes`.
pub fn ingest_file(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    extractors: &ExtractorRegistry,
    path: &Path,
    opts: &IngestOptions,
) -> Result<IngestResult> {
    let abs_path = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let key = abs_path.to_string_lossy().to_string();

    let sha256 = file_sha256(&abs_path)?;
    if let Some(existing) = store.read_corpus_hash(&key)? {
        if existing.sha256 == sha256 && !opts.full {
            tracing::debug!(path = %path.display(), "unchanged, skipping");
            return Ok(IngestResult {
                files_skipped: 1,
                ..Default::default()
            });
        }
        // Replacing the file's chunk set: archive the prior items first.
        for item_id in &existing.item_ids {
            store.archive_item(item_id)?;
        }
    }

    let text = extractors.read_file_text(&abs_path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "untitled".into());

    let mut tags = opts.extra_tags.clone();
    let mut title_base = stem.clone();
    if opts.auto_format {
        // Tags come from components below the mount root when syncing.
        let tag_path = opts
            .rel_path
            .as_ref()
            .map(|rel| Path::new(rel).to_path_buf())
            .unwrap_or_else(|| path.to_path_buf());
        tags.extend(infer_tags(&tag_path));
        title_base = infer_title(&text, &stem);
    }

    let display_path = opts
        .rel_path
        .clone()
        .unwrap_or_else(|| path.display().to_string());

    let metadata = std::fs::metadata(&abs_path).ok();
    let mut result = ingest_text(
        store,
        policy,
        &text,
        &title_base,
        &tags,
        &display_path,
        &key,
        &sha256,
        opts,
    )?;

    store.write_corpus_hash(&CorpusFile {
        file_path: key,
        sha256,
        chunk_count: result.chunks_created as u64,
        item_ids: result.item_ids.clone(),
        ingested_at: now_iso(),
        mount_id: opts.mount_id.clone(),
        rel_path: opts.rel_path.clone(),
        ext: Some(extension_of(path)).filter(|e| !e.is_empty()),
        size_bytes: metadata.as_ref().map(|m| m.len()),
        mtime_epoch: metadata.and_then(|m| {
            m.modified().ok().and_then(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_secs() as i64)
            })
        }),
        lang_hint: opts.lang_hint.clone(),
    })?;

    result.files_processed = 1;
    tracing::info!(
        path = %path.display(),
        chunks = result.chunks_created,
        rejected = result.chunks_rejected,
        "ingested"
    );
    Ok(result)
}

/// Ingest text from a reader (stdin). Dedup key is the literal
/// `<stdin>` path with a text hash.
pub fn ingest_reader(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    reader: &mut impl Read,
    title: Option<&str>,
    opts: &IngestOptions,
) -> Result<IngestResult> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    if text.trim().is_empty() {
        return Ok(IngestResult::default());
    }

    let sha256 = text_sha256(&text);
    if !opts.full {
        if let Some(existing) = store.read_corpus_hash("<stdin>")? {
            if existing.sha256 == sha256 {
                return Ok(IngestResult {
                    files_skipped: 1,
                    ..Default::default()
                });
            }
        }
    }

    let title_base = title
        .map(str::to_string)
        .unwrap_or_else(|| infer_title(&text, "stdin"));

    let mut result = ingest_text(
        store,
        policy,
        &text,
        &title_base,
        &opts.extra_tags,
        "<stdin>",
        "<stdin>",
        &sha256,
        opts,
    )?;

    store.write_corpus_hash(&CorpusFile {
        file_path: "<stdin>".into(),
        sha256,
        chunk_count: result.chunks_created as u64,
        item_ids: result.item_ids.clone(),
        ingested_at: now_iso(),
        mount_id: None,
        rel_path: None,
        ext: None,
        size_bytes: Some(text.len() as u64),
        mtime_epoch: None,
        lang_hint: opts.lang_hint.clone(),
    })?;

    result.files_processed = 1;
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn ingest_text(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    text: &str,
    title_base: &str,
    tags: &[String],
    display_path: &str,
    source_id: &str,
    sha256: &str,
    opts: &IngestOptions,
) -> Result<IngestResult> {
    let chunks: Vec<Chunk> = ParagraphChunks::new(text, opts.max_chunk_chars).collect();
    let total = chunks.len();
    let mut result = IngestResult::default();

    for (i, chunk) in chunks.into_iter().enumerate() {
        let title = if total > 1 {
            format!("{title_base} [{}/{total}]", i + 1)
        } else {
            title_base.to_string()
        };

        let header = format!(
            "[path:{display_path} chunk:{i} lines:{}-{}]",
            chunk.start_line, chunk.end_line
        );
        let content = format!("{header}\n{}", chunk.text);

        let proposal = MemoryProposal {
            item_type: Some(MemoryType::Note),
            title,
            content,
            tags: tags.to_vec(),
            why_store: format!("ingested from {display_path}"),
            scope: opts.scope.clone(),
            provenance: Provenance {
                source_kind: SourceKind::Doc,
                source_id: source_id.to_string(),
                justification: format!("chunk {i} of {display_path} (sha256:{sha256})"),
                session_id: None,
            },
        };

        match commit_proposal(store, policy, proposal, "ingest")? {
            CommitOutcome::Stored { id, quarantined, .. } => {
                result.chunks_created += 1;
                if quarantined {
                    result.chunks_quarantined += 1;
                }
                if !opts.injectable && !quarantined {
                    store.update_item(&id, |it| it.injectable = false)?;
                }
                result.item_ids.push(id);
            }
            CommitOutcome::Rejected { rule_id, .. } => {
                tracing::warn!(chunk = i, rule = %rule_id, "chunk rejected by policy");
                result.chunks_rejected += 1;
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn fixtures() -> (MemoryStore, MemoryPolicy, ExtractorRegistry) {
        (
            MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap(),
            MemoryPolicy::new(PolicyConfig::default()),
            ExtractorRegistry::new(),
        )
    }

    #[test]
    fn chunker_splits_on_blank_lines() {
        let text = "first paragraph\nstill first\n\n\
                    second paragraph goes here\n\n\n\
                    third paragraph content xx";
        let chunks: Vec<Chunk> = ParagraphChunks::new(text, 40).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "first paragraph\nstill first");
        assert_eq!(chunks[0].start_line, 0);
        assert_eq!(chunks[0].end_line, 1);
        assert_eq!(chunks[1].text, "second paragraph goes here");
        assert_eq!(chunks[2].text, "third paragraph content xx");
        assert_eq!(chunks[2].start_line, 6);
    }

    #[test]
    fn chunker_merges_short_paragraphs() {
        let text = "aaa\n\nbbb\n\nccc";
        let chunks: Vec<Chunk> = ParagraphChunks::new(text, 100).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "aaa\n\nbbb\n\nccc");
    }

    #[test]
    fn chunker_respects_ceiling() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks: Vec<Chunk> = ParagraphChunks::new(text, 10).collect();
        // 4+2+4 = 10 fits; adding the third would be 16
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaa\n\nbbbb");
        assert_eq!(chunks[1].text, "cccc");
    }

    #[test]
    fn oversized_paragraph_splits_at_lines() {
        let long = format!("{}\n{}\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let chunks: Vec<Chunk> = ParagraphChunks::new(&long, 50).collect();
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 50));
    }

    #[test]
    fn single_long_line_hard_splits() {
        let line = "x".repeat(120);
        let chunks: Vec<Chunk> = ParagraphChunks::new(&line, 50).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 50));
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert_eq!(ParagraphChunks::new("", 100).count(), 0);
        assert_eq!(ParagraphChunks::new("\n\n  \n", 100).count(), 0);
    }

    #[test]
    fn title_from_first_heading() {
        assert_eq!(infer_title("# The Title\n\nbody", "fallback"), "The Title");
        assert_eq!(infer_title("## Deep Title", "fallback"), "Deep Title");
        assert_eq!(infer_title("no heading here", "fallback"), "fallback");
    }

    #[test]
    fn tags_from_extension_and_parents() {
        let tags = infer_tags(Path::new("docs/Design Notes/schema.md"));
        assert_eq!(tags, vec!["markdown", "docs", "design-notes"]);
    }

    #[test]
    fn ingest_file_is_idempotent() {
        let (mut store, policy, extractors) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes\n\nparagraph one\n\nparagraph two").unwrap();

        let first = ingest_file(&mut store, &policy, &extractors, &path, &IngestOptions::default())
            .unwrap();
        assert_eq!(first.files_processed, 1);
        assert!(first.chunks_created >= 1);

        let second =
            ingest_file(&mut store, &policy, &extractors, &path, &IngestOptions::default())
                .unwrap();
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.chunks_created, 0);

        let total = store
            .count_items(&crate::memory::store::ItemFilter::default())
            .unwrap();
        assert_eq!(total, first.chunks_created as u64);
    }

    #[test]
    fn changed_file_reingests() {
        let (mut store, policy, extractors) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "version one").unwrap();
        ingest_file(&mut store, &policy, &extractors, &path, &IngestOptions::default()).unwrap();

        std::fs::write(&path, "version two with more words").unwrap();
        let second =
            ingest_file(&mut store, &policy, &extractors, &path, &IngestOptions::default())
                .unwrap();
        assert_eq!(second.files_processed, 1);
        assert_eq!(second.chunks_created, 1);
    }

    #[test]
    fn secret_chunk_rejected_others_stored() {
        let (mut store, policy, extractors) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.md");
        std::fs::write(
            &path,
            "safe paragraph about the design\n\n\
             api_key = verysecretvalue99\n\n\
             another safe paragraph",
        )
        .unwrap();

        let result =
            ingest_file(&mut store, &policy, &extractors, &path, &IngestOptions::default())
                .unwrap();
        assert_eq!(result.chunks_rejected, 1);
        assert_eq!(result.chunks_created, 2);
    }

    #[test]
    fn resolve_sources_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("sub/b.rs"), "b").unwrap();
        std::fs::write(dir.path().join("skip.exe"), "x").unwrap();

        let sources =
            resolve_sources(&[dir.path().to_string_lossy().to_string()]).unwrap();
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn resolve_sources_missing_file_errors() {
        let err = resolve_sources(&["/definitely/not/here.md".to_string()]).unwrap_err();
        assert!(matches!(err, MemctlError::Validation(_)));
    }

    #[test]
    fn ingest_reader_dedups_stdin() {
        let (mut store, policy, _extractors) = fixtures();
        let text = "stdin paragraph for the store";

        let first = ingest_reader(
            &mut store,
            &policy,
            &mut text.as_bytes(),
            Some("Piped"),
            &IngestOptions::default(),
        )
        .unwrap();
        assert_eq!(first.chunks_created, 1);

        let second = ingest_reader(
            &mut store,
            &policy,
            &mut text.as_bytes(),
            Some("Piped"),
            &IngestOptions::default(),
        )
        .unwrap();
        assert_eq!(second.files_skipped, 1);
    }
}
