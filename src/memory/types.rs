//! Core memory type definitions.
//!
//! Defines [`MemoryItem`] (the primary unit), [`MemoryProposal`] (a candidate
//! awaiting policy evaluation), [`MemoryEvent`] (append-only audit record),
//! [`MemoryLink`] (typed edges between items), and the supporting enums for
//! tiers, types, and search strategies.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Memory lifecycle tiers: short-, medium-, and long-term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Stm,
    Mtm,
    Ltm,
}

impl MemoryTier {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stm => "stm",
            Self::Mtm => "mtm",
            Self::Ltm => "ltm",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stm" => Ok(Self::Stm),
            "mtm" => Ok(Self::Mtm),
            "ltm" => Ok(Self::Ltm),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// Item type labels. The vocabulary is open at the serialization boundary:
/// unknown labels coerce to the closest known variant (`Note` as fallback)
/// rather than failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum MemoryType {
    Fact,
    Decision,
    Definition,
    Constraint,
    Pattern,
    Todo,
    /// Reference to external content; exempt from the content length cap.
    Pointer,
    Note,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Definition => "definition",
            Self::Constraint => "constraint",
            Self::Pattern => "pattern",
            Self::Todo => "todo",
            Self::Pointer => "pointer",
            Self::Note => "note",
        }
    }
}

impl From<String> for MemoryType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "fact" => Self::Fact,
            "decision" => Self::Decision,
            "definition" => Self::Definition,
            "constraint" | "rule" | "requirement" => Self::Constraint,
            "pattern" | "process" => Self::Pattern,
            "todo" => Self::Todo,
            "pointer" => Self::Pointer,
            _ => Self::Note,
        }
    }
}

impl From<&str> for MemoryType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a memory item originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Chat,
    Doc,
    Tool,
    Mixed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Doc => "doc",
            Self::Tool => "tool",
            Self::Mixed => "mixed",
        }
    }
}

/// Origin record carried by every item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Provenance {
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default)]
    pub source_id: String,
    /// Human-readable justification for storing the item.
    #[serde(default)]
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// SHA-256 content hash with a scheme prefix, e.g. `sha256:ab12…`.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("sha256:{digest:x}")
}

/// Current UTC time as an ISO-8601 string.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Mint a prefixed, time-sortable identifier (UUID v7 hex body).
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7().simple())
}

/// The primary unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Lexicographically sortable id, stable for the item's lifetime.
    pub id: String,
    pub tier: MemoryTier,
    #[serde(rename = "type")]
    pub item_type: MemoryType,
    pub title: String,
    pub content: String,
    /// Tag set: order irrelevant, duplicates collapsed at write time.
    pub tags: Vec<String>,
    /// Optional namespace for isolation.
    pub scope: String,
    pub provenance: Provenance,
    /// False for quarantined items: searchable but excluded from injection.
    pub injectable: bool,
    /// Excluded from default views but retained.
    pub archived: bool,
    /// Set when a consolidation survivor replaced this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub usage_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl MemoryItem {
    /// Build a fresh STM item with generated id and timestamps.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_iso();
        Self {
            id: generate_id("MEM"),
            tier: MemoryTier::Stm,
            item_type: MemoryType::Note,
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
            scope: "project".into(),
            provenance: Provenance::default(),
            injectable: true,
            archived: false,
            superseded_by: None,
            usage_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Hash of the canonical content.
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }

    /// Normalized tag set: lowercased, deduplicated, original order kept.
    pub fn normalized_tags(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.tags
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }
}

/// A candidate item submitted for policy evaluation. Not stored directly —
/// it must pass through the policy engine first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryProposal {
    #[serde(rename = "type", default)]
    pub item_type: Option<MemoryType>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Required justification; missing justification quarantines.
    #[serde(default)]
    pub why_store: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub provenance: Provenance,
}

impl MemoryProposal {
    /// Convert an accepted proposal into an STM item.
    pub fn into_item(self) -> MemoryItem {
        let mut provenance = self.provenance;
        if provenance.justification.is_empty() {
            provenance.justification = self.why_store;
        }
        let mut item = MemoryItem::new(self.title, self.content);
        item.item_type = self.item_type.unwrap_or(MemoryType::Note);
        item.tags = self.tags;
        if !self.scope.is_empty() {
            item.scope = self.scope;
        }
        item.provenance = provenance;
        item
    }
}

/// Append-only audit record. Events are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub action: EventAction,
    pub item_id: Option<String>,
    pub detail: serde_json::Value,
    pub content_hash: String,
    pub timestamp: String,
}

/// Closed set of event actions; the serialization boundary is the only
/// place these become strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Write,
    Read,
    Update,
    Archive,
    Consolidate,
    Search,
    LoopIter,
    PolicyReject,
    PolicyQuarantine,
    Reindex,
    Link,
    MountRegister,
    MountRemove,
    Reset,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::Update => "update",
            Self::Archive => "archive",
            Self::Consolidate => "consolidate",
            Self::Search => "search",
            Self::LoopIter => "loop_iter",
            Self::PolicyReject => "policy_reject",
            Self::PolicyQuarantine => "policy_quarantine",
            Self::Reindex => "reindex",
            Self::Link => "link",
            Self::MountRegister => "mount_register",
            Self::MountRemove => "mount_remove",
            Self::Reset => "reset",
        }
    }
}

impl std::str::FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(Self::Write),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "archive" => Ok(Self::Archive),
            "consolidate" => Ok(Self::Consolidate),
            "search" => Ok(Self::Search),
            "loop_iter" => Ok(Self::LoopIter),
            "policy_reject" => Ok(Self::PolicyReject),
            "policy_quarantine" => Ok(Self::PolicyQuarantine),
            "reindex" => Ok(Self::Reindex),
            "link" => Ok(Self::Link),
            "mount_register" => Ok(Self::MountRegister),
            "mount_remove" => Ok(Self::MountRemove),
            "reset" => Ok(Self::Reset),
            _ => Err(format!("unknown event action: {s}")),
        }
    }
}

/// Typed relationship labels between items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRel {
    Supersedes,
    Supports,
    Contradicts,
    Refines,
}

impl LinkRel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supersedes => "supersedes",
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Refines => "refines",
        }
    }
}

impl std::str::FromStr for LinkRel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supersedes" => Ok(Self::Supersedes),
            "supports" => Ok(Self::Supports),
            "contradicts" => Ok(Self::Contradicts),
            "refines" => Ok(Self::Refines),
            _ => Err(format!("unknown link relation: {s}")),
        }
    }
}

/// Directed relationship between two item ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub src_id: String,
    pub dst_id: String,
    pub rel: LinkRel,
    pub created_at: String,
}

impl MemoryLink {
    pub fn new(src_id: impl Into<String>, dst_id: impl Into<String>, rel: LinkRel) -> Self {
        Self {
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            rel,
            created_at: now_iso(),
        }
    }
}

/// One row per ingested file. Keyed by absolute path; ensures idempotent
/// re-ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusFile {
    pub file_path: String,
    pub sha256: String,
    pub chunk_count: u64,
    pub item_ids: Vec<String>,
    pub ingested_at: String,
    pub mount_id: Option<String>,
    pub rel_path: Option<String>,
    pub ext: Option<String>,
    pub size_bytes: Option<u64>,
    pub mtime_epoch: Option<i64>,
    pub lang_hint: Option<String>,
}

/// A registered folder; the unit of scoping and delta sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRecord {
    pub mount_id: String,
    pub path: String,
    pub name: Option<String>,
    pub ignore_patterns: Vec<String>,
    pub lang_hint: Option<String>,
    pub created_at: String,
    pub last_sync_at: Option<String>,
}

/// Which rung of the FTS cascade produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStrategy {
    And,
    ReducedAnd,
    PrefixAnd,
    OrFallback,
    Like,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::ReducedAnd => "REDUCED_AND",
            Self::PrefixAnd => "PREFIX_AND",
            Self::OrFallback => "OR_FALLBACK",
            Self::Like => "LIKE",
        }
    }
}

/// How a search query was resolved. Advisory — callers that don't need it
/// can ignore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMeta {
    pub strategy: SearchStrategy,
    pub original_terms: Vec<String>,
    pub effective_terms: Vec<String>,
    pub dropped_terms: Vec<String>,
    pub total_candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_rank: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub morphological_hint: Option<String>,
}

impl SearchMeta {
    pub fn empty() -> Self {
        Self {
            strategy: SearchStrategy::And,
            original_terms: Vec::new(),
            effective_terms: Vec::new(),
            dropped_terms: Vec::new(),
            total_candidates: 0,
            top_rank: None,
            morphological_hint: None,
        }
    }
}
