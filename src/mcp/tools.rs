//! The MCP tool surface: 15 tools, each traversing the locked middleware
//! order guard → session → rate limit → execute → audit. No tool bypasses
//! any layer.

use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use schemars::JsonSchema;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ask::{ask_folder, AskOptions};
use crate::export_import::{export_items, import_items};
use crate::format::format_injection_block;
use crate::inspect::{format_inspect_block, inspect_path, inspect_stats, SyncMode};
use crate::llm::{PromptMode, SubprocessInvoker};
use crate::memory::consolidate::consolidate;
use crate::memory::store::ItemFilter;
use crate::memory::types::{MemoryProposal, MemoryTier, MemoryType, Provenance, SourceKind};
use crate::mcp::audit::{AuditLogger, AuditOutcome};
use crate::mcp::rate_limiter::{classify_tool, ToolClass};
use crate::mcp::session::SessionTracker;
use crate::mcp::ServerContext;
use crate::mount::{find_mount, register_mount};
use crate::proposer::{commit_item, commit_proposal, CommitOutcome};
use crate::recall_loop::{run_loop, LoopOptions, Protocol};
use crate::sync::{sync_all, sync_mount};

/// How a tool body fails: `Blocked` covers policy and rate-limit refusals,
/// `Error` covers validation and internal failures.
enum ToolFailure {
    Blocked {
        message: String,
        detail: serde_json::Value,
    },
    Error(String),
}

impl From<crate::error::MemctlError> for ToolFailure {
    fn from(e: crate::error::MemctlError) -> Self {
        ToolFailure::Error(e.to_string())
    }
}

impl From<serde_json::Error> for ToolFailure {
    fn from(e: serde_json::Error) -> Self {
        ToolFailure::Error(format!("serialization failed: {e}"))
    }
}

type ToolResult = std::result::Result<serde_json::Value, ToolFailure>;

/// Run one tool body through the full middleware pipeline. Blocking work
/// happens on the caller's thread — tools dispatch here via
/// `spawn_blocking`.
fn execute_tool(
    ctx: &ServerContext,
    tool: &str,
    write_bytes: Option<usize>,
    body: impl FnOnce(&ServerContext) -> ToolResult,
) -> std::result::Result<String, String> {
    let started = Instant::now();
    let rid = AuditLogger::new_rid();
    let session_id = SessionTracker::resolve_session_id(None);
    let class = classify_tool(tool);

    // L0 guard: write size and byte budget for content-carrying calls.
    if let Some(bytes) = write_bytes {
        let mut guard = ctx.guard.lock().expect("guard lock");
        if let Err(e) = guard
            .check_write_bytes(bytes)
            .and_then(|()| guard.check_write_budget(&session_id, bytes))
        {
            let detail = serde_json::json!({ "guard": e.to_string() });
            ctx.audit.log(
                tool,
                &rid,
                &session_id,
                &ctx.db_display,
                AuditOutcome::Blocked,
                Some(detail.clone()),
                started.elapsed().as_secs_f64() * 1000.0,
            );
            return Ok(serde_json::json!({ "status": "blocked", "d": detail }).to_string());
        }
    }

    // L1 session: turn accounting.
    {
        let mut sessions = ctx.sessions.lock().expect("session lock");
        let state = sessions.get_or_create(&session_id);
        state.increment_turn();
        if class == ToolClass::Write {
            state.record_write();
        }
    }
    if let Some(ref limiter) = ctx.limiter {
        limiter
            .lock()
            .expect("limiter lock")
            .reset_turn(&session_id);
    }

    // L1 rate limit: refuse at entry.
    if let Some(ref limiter) = ctx.limiter {
        let mut limiter = limiter.lock().expect("limiter lock");
        let refused = match class {
            ToolClass::Write => limiter.check_write(&session_id).err(),
            ToolClass::Read => limiter.check_read(&session_id).err(),
            ToolClass::Exempt => None,
        };
        if let Some(e) = refused {
            let detail = serde_json::json!({
                "rate_limit": e.message,
                "retry_after_ms": e.retry_after_ms,
            });
            ctx.audit.log(
                tool,
                &rid,
                &session_id,
                &ctx.db_display,
                AuditOutcome::Blocked,
                Some(detail.clone()),
                started.elapsed().as_secs_f64() * 1000.0,
            );
            return Ok(serde_json::json!({ "status": "blocked", "d": detail }).to_string());
        }
    }

    // Execute, then audit exactly once for every outcome.
    let outcome = body(ctx);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(mut response) => {
            let detail = response.get("d").cloned();
            ctx.audit.log(
                tool,
                &rid,
                &session_id,
                &ctx.db_display,
                AuditOutcome::Ok,
                detail,
                elapsed_ms,
            );
            if response.get("status").is_none() {
                response["status"] = "ok".into();
            }
            Ok(response.to_string())
        }
        Err(ToolFailure::Blocked { message, detail }) => {
            ctx.audit.log(
                tool,
                &rid,
                &session_id,
                &ctx.db_display,
                AuditOutcome::Blocked,
                Some(detail.clone()),
                elapsed_ms,
            );
            Ok(serde_json::json!({
                "status": "blocked",
                "message": message,
                "d": detail,
            })
            .to_string())
        }
        Err(ToolFailure::Error(message)) => {
            ctx.audit.log(
                tool,
                &rid,
                &session_id,
                &ctx.db_display,
                AuditOutcome::Error,
                Some(serde_json::json!({ "error": message })),
                elapsed_ms,
            );
            Err(message)
        }
    }
}

// ── Parameter shapes (part of the external contract) ─────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecallParams {
    /// Natural language search query.
    pub query: String,
    /// Token budget for the injection block (default 1500).
    pub budget_tokens: Option<usize>,
    /// Filter by tier: stm|mtm|ltm.
    pub tier: Option<String>,
    /// Filter by scope.
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Search text (FTS cascade).
    pub query: String,
    /// Comma-separated tags to filter by.
    pub tags: Option<String>,
    pub tier: Option<String>,
    /// Filter by item type (fact|decision|definition|...).
    pub type_filter: Option<String>,
    pub scope: Option<String>,
    /// Max results (default 10).
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProposeParams {
    /// JSON array of proposals: {title, content, tags[], type, why_store}.
    pub items: String,
    /// Memory scope (default "project").
    pub scope: Option<String>,
    /// Source document recorded as provenance for every proposal.
    pub source_doc: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    pub title: String,
    pub content: String,
    /// Item type (default note).
    pub r#type: Option<String>,
    /// Target tier (default stm).
    pub tier: Option<String>,
    pub tags: Option<Vec<String>>,
    pub scope: Option<String>,
    /// Why this item should persist.
    pub why_store: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadParams {
    /// Item ids to hydrate.
    pub ids: Vec<String>,
    /// Count this read toward usage-based promotion.
    pub touch: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StatsParams {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConsolidateParams {
    pub scope: Option<String>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MountParams {
    /// One of add|list|remove.
    pub action: String,
    /// Folder path (add) or mount id/name/path (remove).
    pub path: Option<String>,
    /// Display name for the mount.
    pub name: Option<String>,
    /// Glob patterns excluded from sync.
    pub ignore: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SyncParams {
    /// Folder to sync; all registered mounts when omitted.
    pub path: Option<String>,
    /// Re-process every file, ignoring stored hashes.
    pub full: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectParams {
    /// Folder to inspect (auto-mounted); whole store when omitted.
    pub path: Option<String>,
    /// Token budget for the structural block (default 2200).
    pub budget: Option<usize>,
    /// Sync policy: auto|always|never (default auto).
    pub sync: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AskParams {
    /// Folder to ask about.
    pub path: String,
    pub question: String,
    /// LLM command override (falls back to server configuration).
    pub llm_cmd: Option<String>,
    pub budget: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExportParams {
    pub tier: Option<String>,
    pub type_filter: Option<String>,
    pub scope: Option<String>,
    pub include_archived: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImportParams {
    /// JSONL payload, one item per line.
    pub jsonl: String,
    pub preserve_ids: Option<bool>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LoopParams {
    pub question: String,
    /// Initial context block.
    pub context: Option<String>,
    pub llm_cmd: Option<String>,
    pub max_calls: Option<u32>,
    /// Protocol: json|regex|passive (default json).
    pub protocol: Option<String>,
    /// Restrict recall to one mount.
    pub mount_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReindexParams {
    /// Tokenizer preset (fr|en|raw) or a custom FTS5 tokenizer string.
    pub tokenizer: Option<String>,
}

// ── Shared parsing helpers ───────────────────────────────────────────────────

fn parse_tier(tier: Option<&str>) -> std::result::Result<Option<MemoryTier>, ToolFailure> {
    tier.map(|t| {
        t.parse::<MemoryTier>()
            .map_err(ToolFailure::Error)
    })
    .transpose()
}

fn filter_from(
    tier: Option<&str>,
    type_filter: Option<&str>,
    scope: Option<&str>,
    include_archived: bool,
) -> std::result::Result<ItemFilter, ToolFailure> {
    Ok(ItemFilter {
        tier: parse_tier(tier)?,
        type_filter: type_filter.map(MemoryType::from),
        scope: scope.map(str::to_string),
        include_archived,
    })
}

fn item_summary(item: &crate::memory::types::MemoryItem) -> serde_json::Value {
    let preview: String = item.content.chars().take(200).collect();
    serde_json::json!({
        "id": item.id,
        "title": item.title,
        "tier": item.tier.as_str(),
        "type": item.item_type.as_str(),
        "tags": item.tags,
        "content_preview": preview,
        "quarantined": !item.injectable,
    })
}

/// The memctl MCP tool handler. Holds the explicit server context and
/// exposes all tools via the tool router.
#[derive(Clone)]
pub struct MemctlTools {
    tool_router: ToolRouter<Self>,
    ctx: Arc<ServerContext>,
}

impl MemctlTools {
    async fn run<F>(&self, tool: &'static str, write_bytes: Option<usize>, body: F) -> std::result::Result<String, String>
    where
        F: FnOnce(&ServerContext) -> ToolResult + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || execute_tool(&ctx, tool, write_bytes, body))
            .await
            .map_err(|e| format!("tool task failed: {e}"))?
    }
}

#[tool_router]
impl MemctlTools {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            ctx,
        }
    }

    /// PRIMARY: token-budgeted retrieval for context injection.
    #[tool(description = "Token-budgeted memory retrieval for context injection. Returns an injection block (format_version=1) plus a structured item catalog.")]
    async fn memory_recall(
        &self,
        Parameters(params): Parameters<RecallParams>,
    ) -> Result<String, String> {
        self.run("memory_recall", None, move |ctx| {
            let budget = params.budget_tokens.unwrap_or(1500);
            let mut store = ctx.store.lock().expect("store lock");
            let filter = filter_from(params.tier.as_deref(), None, params.scope.as_deref(), false)?;
            let (items, meta) = store.search_fulltext(&params.query, &filter, 50)?;
            let injectable: Vec<_> = items.into_iter().filter(|it| it.injectable).collect();

            let block =
                format_injection_block(&injectable, budget, injectable.len(), "memory_recall");
            let catalog: Vec<_> = injectable.iter().map(item_summary).collect();
            Ok(serde_json::json!({
                "inject_text": block,
                "items": catalog,
                "matched": injectable.len(),
                "tokens_used": block.chars().count() / 4,
                "search_meta": meta,
                "format_version": crate::format::FORMAT_VERSION,
            }))
        })
        .await
    }

    /// SECONDARY: interactive discovery.
    #[tool(description = "Search memory items by text query, tags, and filters. Returns structured results, not an injection block; quarantined items are flagged.")]
    async fn memory_search(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<String, String> {
        self.run("memory_search", None, move |ctx| {
            let k = params.k.unwrap_or(10);
            let mut store = ctx.store.lock().expect("store lock");
            let filter = filter_from(
                params.tier.as_deref(),
                params.type_filter.as_deref(),
                params.scope.as_deref(),
                false,
            )?;

            let items = if let Some(ref tags) = params.tags {
                let tag_list: Vec<String> =
                    tags.split(',').map(|t| t.trim().to_string()).collect();
                let mut hits = store.search_by_tags(&tag_list, &filter, k)?;
                if !params.query.trim().is_empty() {
                    let needle = params.query.to_lowercase();
                    hits.retain(|it| {
                        it.title.to_lowercase().contains(&needle)
                            || it.content.to_lowercase().contains(&needle)
                    });
                }
                hits
            } else {
                store.search_fulltext(&params.query, &filter, k)?.0
            };

            let results: Vec<_> = items.iter().map(item_summary).collect();
            Ok(serde_json::json!({
                "count": results.len(),
                "items": results,
                "search_meta": store.last_search_meta(),
            }))
        })
        .await
    }

    /// DEFAULT write path: governed proposals.
    #[tool(description = "Submit memory candidates for policy evaluation and storage. Approved items land in STM; rejected items return the firing rule id.")]
    async fn memory_propose(
        &self,
        Parameters(params): Parameters<ProposeParams>,
    ) -> Result<String, String> {
        let bytes = params.items.len();
        self.run("memory_propose", Some(bytes), move |ctx| {
            let parsed: serde_json::Value = serde_json::from_str(&params.items)
                .map_err(|e| ToolFailure::Error(format!("invalid JSON in items: {e}")))?;
            let list = match parsed {
                serde_json::Value::Array(a) => a,
                other => vec![other],
            };

            // Per-turn proposal cap.
            if let Some(ref limiter) = ctx.limiter {
                let session_id = SessionTracker::resolve_session_id(None);
                if let Err(e) = limiter
                    .lock()
                    .expect("limiter lock")
                    .check_proposals(&session_id, list.len())
                {
                    return Err(ToolFailure::Blocked {
                        message: e.message.clone(),
                        detail: serde_json::json!({ "rate_limit": e.message }),
                    });
                }
            }

            let scope = params.scope.clone().unwrap_or_else(|| "project".into());
            let mut store = ctx.store.lock().expect("store lock");
            let mut accepted = 0;
            let mut quarantined = 0;
            let mut rejected = 0;
            let mut per_item = Vec::new();

            for entry in list {
                let mut proposal: MemoryProposal = serde_json::from_value(entry)
                    .map_err(|e| ToolFailure::Error(format!("invalid proposal: {e}")))?;
                if proposal.scope.is_empty() {
                    proposal.scope = scope.clone();
                }
                if let Some(ref doc) = params.source_doc {
                    if proposal.provenance.source_id.is_empty() {
                        proposal.provenance = Provenance {
                            source_kind: SourceKind::Doc,
                            source_id: doc.clone(),
                            ..proposal.provenance
                        };
                    }
                }
                let title = proposal.title.clone();
                match commit_proposal(&mut store, &ctx.policy, proposal, "propose")? {
                    CommitOutcome::Stored { id, quarantined: q, rule_id } => {
                        accepted += 1;
                        if q {
                            quarantined += 1;
                        }
                        per_item.push(serde_json::json!({
                            "title": title,
                            "action": if q { "quarantine" } else { "accept" },
                            "id": id,
                            "rule": rule_id,
                        }));
                    }
                    CommitOutcome::Rejected { rule_id, reason } => {
                        rejected += 1;
                        per_item.push(serde_json::json!({
                            "title": title,
                            "action": "reject",
                            "rule": rule_id,
                            "reason": reason,
                        }));
                    }
                }
            }

            Ok(serde_json::json!({
                "accepted": accepted,
                "quarantined": quarantined,
                "rejected": rejected,
                "items": per_item,
                "d": { "accepted": accepted, "rejected": rejected },
            }))
        })
        .await
    }

    /// Privileged direct write (policy still applies).
    #[tool(description = "Write a memory item directly. The policy engine still evaluates the content; a rejection returns blocked with d.policy set.")]
    async fn memory_write(
        &self,
        Parameters(params): Parameters<WriteParams>,
    ) -> Result<String, String> {
        let bytes = params.content.len();
        self.run("memory_write", Some(bytes), move |ctx| {
            let mut item = crate::memory::types::MemoryItem::new(
                params.title.clone(),
                params.content.clone(),
            );
            if let Some(ref t) = params.r#type {
                item.item_type = MemoryType::from(t.as_str());
            }
            if let Some(ref tier) = params.tier {
                item.tier = tier.parse().map_err(ToolFailure::Error)?;
            }
            if let Some(tags) = params.tags.clone() {
                item.tags = tags;
            }
            if let Some(ref scope) = params.scope {
                item.scope = scope.clone();
            }
            item.provenance = Provenance {
                source_kind: SourceKind::Tool,
                source_id: "memory_write".into(),
                justification: params.why_store.clone().unwrap_or_default(),
                session_id: None,
            };

            let detail = AuditLogger::content_detail(&params.content);
            let mut store = ctx.store.lock().expect("store lock");
            match commit_item(&mut store, &ctx.policy, item, "write")? {
                CommitOutcome::Stored { id, quarantined, .. } => Ok(serde_json::json!({
                    "id": id,
                    "quarantined": quarantined,
                    "d": detail,
                })),
                CommitOutcome::Rejected { rule_id, reason } => Err(ToolFailure::Blocked {
                    message: reason,
                    detail: serde_json::json!({ "policy": rule_id, "content": detail }),
                }),
            }
        })
        .await
    }

    /// Hydrate items by id.
    #[tool(description = "Read memory items by id. Optionally counts the read toward usage-based tier promotion.")]
    async fn memory_read(
        &self,
        Parameters(params): Parameters<ReadParams>,
    ) -> Result<String, String> {
        self.run("memory_read", None, move |ctx| {
            let mut store = ctx.store.lock().expect("store lock");
            let touch = params.touch.unwrap_or(false);
            let mut found = Vec::new();
            let mut missing = Vec::new();
            for id in &params.ids {
                match store.read_item(id, touch)? {
                    Some(item) => found.push(serde_json::to_value(&item)?),
                    None => missing.push(id.clone()),
                }
            }
            Ok(serde_json::json!({ "items": found, "missing": missing }))
        })
        .await
    }

    /// Store statistics (exempt from rate limiting).
    #[tool(description = "Memory store statistics: counts by tier and type, event count, FTS tokenizer state.")]
    async fn memory_stats(
        &self,
        Parameters(_params): Parameters<StatsParams>,
    ) -> Result<String, String> {
        self.run("memory_stats", None, move |ctx| {
            let store = ctx.store.lock().expect("store lock");
            Ok(serde_json::to_value(store.stats()?)?)
        })
        .await
    }

    /// Deterministic consolidation.
    #[tool(description = "Run deterministic STM→MTM→LTM consolidation: cluster by type and tag overlap, merge, archive originals, promote by usage.")]
    async fn memory_consolidate(
        &self,
        Parameters(params): Parameters<ConsolidateParams>,
    ) -> Result<String, String> {
        self.run("memory_consolidate", None, move |ctx| {
            let mut store = ctx.store.lock().expect("store lock");
            let report = consolidate(
                &mut store,
                &ctx.config.consolidate,
                params.scope.as_deref(),
                params.dry_run.unwrap_or(false),
            )?;
            Ok(serde_json::to_value(report)?)
        })
        .await
    }

    /// Mount metadata operations (exempt from rate limiting).
    #[tool(description = "Manage folder mounts: add, list, or remove. Registration is metadata-only; use memory_sync to ingest.")]
    async fn memory_mount(
        &self,
        Parameters(params): Parameters<MountParams>,
    ) -> Result<String, String> {
        self.run("memory_mount", None, move |ctx| {
            let mut store = ctx.store.lock().expect("store lock");
            match params.action.as_str() {
                "add" => {
                    let path = params.path.as_deref().ok_or_else(|| {
                        ToolFailure::Error("mount add requires a path".into())
                    })?;
                    let ignore = params.ignore.clone().unwrap_or_default();
                    let mount_id = register_mount(
                        &mut store,
                        std::path::Path::new(path),
                        params.name.as_deref(),
                        &ignore,
                        None,
                    )?;
                    Ok(serde_json::json!({ "mount_id": mount_id }))
                }
                "list" => {
                    let mounts = store.list_mounts()?;
                    Ok(serde_json::json!({ "mounts": serde_json::to_value(mounts)? }))
                }
                "remove" => {
                    let key = params.path.as_deref().or(params.name.as_deref()).ok_or_else(
                        || ToolFailure::Error("mount remove requires a path or name".into()),
                    )?;
                    let removed = store.remove_mount(key)?;
                    Ok(serde_json::json!({ "removed": removed }))
                }
                other => Err(ToolFailure::Error(format!(
                    "unknown mount action {other:?}: expected add|list|remove"
                ))),
            }
        })
        .await
    }

    /// Delta sync of one mount or all mounts.
    #[tool(description = "Sync registered folders into memory with 3-tier delta detection (absent / metadata-match / hash-compare). Auto-mounts new paths.")]
    async fn memory_sync(
        &self,
        Parameters(params): Parameters<SyncParams>,
    ) -> Result<String, String> {
        self.run("memory_sync", None, move |ctx| {
            let delta = !params.full.unwrap_or(false);
            let max_chunk = crate::ingest::DEFAULT_MAX_CHUNK_CHARS;
            let mut store = ctx.store.lock().expect("store lock");
            let results = match params.path {
                Some(ref path) => vec![sync_mount(
                    &mut store,
                    &ctx.policy,
                    &ctx.extractors,
                    std::path::Path::new(path),
                    delta,
                    None,
                    max_chunk,
                )?],
                None => sync_all(&mut store, &ctx.policy, &ctx.extractors, delta, max_chunk)?,
            };
            Ok(serde_json::json!({ "results": serde_json::to_value(results)? }))
        })
        .await
    }

    /// Structural inspection with auto-mount and staleness-driven sync.
    #[tool(description = "Deterministic structural digest of a folder or the whole corpus: totals, per-folder and per-extension breakdowns, observations, injection block.")]
    async fn memory_inspect(
        &self,
        Parameters(params): Parameters<InspectParams>,
    ) -> Result<String, String> {
        self.run("memory_inspect", None, move |ctx| {
            let budget = params.budget.unwrap_or(2200);
            let mut store = ctx.store.lock().expect("store lock");
            match params.path {
                Some(ref path) => {
                    let sync_mode: SyncMode = params
                        .sync
                        .as_deref()
                        .unwrap_or("auto")
                        .parse()
                        .map_err(|e: crate::error::MemctlError| ToolFailure::Error(e.to_string()))?;
                    let outcome = inspect_path(
                        &mut store,
                        &ctx.policy,
                        &ctx.extractors,
                        std::path::Path::new(path),
                        sync_mode,
                        &ctx.config.inspect,
                        crate::ingest::DEFAULT_MAX_CHUNK_CHARS,
                        &mut |msg| tracing::info!("{msg}"),
                    )?;
                    let block = format_inspect_block(
                        &outcome.stats,
                        Some(&outcome.mount_label),
                        budget,
                    );
                    let mut value = serde_json::to_value(&outcome)?;
                    value["inject_text"] = block.into();
                    Ok(value)
                }
                None => {
                    let stats = inspect_stats(&store, None, &ctx.config.inspect)?;
                    let block = format_inspect_block(&stats, None, budget);
                    let mut value = serde_json::to_value(&stats)?;
                    value["inject_text"] = block.into();
                    Ok(value)
                }
            }
        })
        .await
    }

    /// One-shot folder Q&A.
    #[tool(description = "Answer a question about a folder: auto-mount, sync when stale, structural context, scoped recall, and one bounded LLM pass.")]
    async fn memory_ask(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<String, String> {
        self.run("memory_ask", None, move |ctx| {
            let cmd = params
                .llm_cmd
                .clone()
                .or_else(|| ctx.llm_cmd.clone())
                .ok_or_else(|| {
                    ToolFailure::Error("no LLM command configured for memory_ask".into())
                })?;
            let mut invoker = SubprocessInvoker::new(&cmd, PromptMode::Stdin)?;
            let mut opts = AskOptions::default();
            if let Some(budget) = params.budget {
                opts.budget_tokens = budget;
            }
            let mut store = ctx.store.lock().expect("store lock");
            let result = ask_folder(
                &mut store,
                &ctx.policy,
                &ctx.extractors,
                &mut invoker,
                std::path::Path::new(&params.path),
                &params.question,
                &ctx.config.inspect,
                &opts,
                &mut |msg| tracing::info!("{msg}"),
            )?;
            Ok(serde_json::to_value(result)?)
        })
        .await
    }

    /// JSONL export of items.
    #[tool(description = "Export memory items as JSONL. Mounts, events, and corpus hashes are machine-local and never exported.")]
    async fn memory_export(
        &self,
        Parameters(params): Parameters<ExportParams>,
    ) -> Result<String, String> {
        self.run("memory_export", None, move |ctx| {
            let store = ctx.store.lock().expect("store lock");
            let filter = filter_from(
                params.tier.as_deref(),
                params.type_filter.as_deref(),
                params.scope.as_deref(),
                params.include_archived.unwrap_or(false),
            )?;
            let mut buffer = Vec::new();
            let count = export_items(&store, &filter, &mut buffer)?;
            Ok(serde_json::json!({
                "count": count,
                "jsonl": String::from_utf8_lossy(&buffer),
            }))
        })
        .await
    }

    /// Policy-gated JSONL import.
    #[tool(description = "Import memory items from JSONL. Every line passes the policy engine; content-hash dedup prevents duplicates. Batch size is capped.")]
    async fn memory_import(
        &self,
        Parameters(params): Parameters<ImportParams>,
    ) -> Result<String, String> {
        let bytes = params.jsonl.len();
        self.run("memory_import", Some(bytes), move |ctx| {
            let line_count = params.jsonl.lines().filter(|l| !l.trim().is_empty()).count();
            {
                let guard = ctx.guard.lock().expect("guard lock");
                guard.check_import_batch(line_count).map_err(|e| {
                    ToolFailure::Blocked {
                        message: e.to_string(),
                        detail: serde_json::json!({ "guard": e.to_string() }),
                    }
                })?;
            }
            // Imports consume one write token per item.
            if let Some(ref limiter) = ctx.limiter {
                let session_id = SessionTracker::resolve_session_id(None);
                if let Err(e) = limiter
                    .lock()
                    .expect("limiter lock")
                    .check_write_n(&session_id, line_count)
                {
                    return Err(ToolFailure::Blocked {
                        message: e.message.clone(),
                        detail: serde_json::json!({ "rate_limit": e.message }),
                    });
                }
            }

            let mut store = ctx.store.lock().expect("store lock");
            let result = import_items(
                &mut store,
                &ctx.policy,
                &mut params.jsonl.as_bytes(),
                params.preserve_ids.unwrap_or(false),
                params.dry_run.unwrap_or(false),
                &mut |msg| tracing::info!("{msg}"),
            )?;
            Ok(serde_json::to_value(result)?)
        })
        .await
    }

    /// Bounded recall-answer loop.
    #[tool(description = "Run the bounded recall-answer loop: the LLM proposes refinement queries, the controller enforces budgets and the five stopping conditions.")]
    async fn memory_loop(
        &self,
        Parameters(params): Parameters<LoopParams>,
    ) -> Result<String, String> {
        self.run("memory_loop", None, move |ctx| {
            let cmd = params
                .llm_cmd
                .clone()
                .or_else(|| ctx.llm_cmd.clone())
                .ok_or_else(|| {
                    ToolFailure::Error("no LLM command configured for memory_loop".into())
                })?;
            let mut invoker = SubprocessInvoker::new(&cmd, PromptMode::Stdin)?;
            let mut opts = LoopOptions {
                max_calls: params.max_calls.unwrap_or(ctx.config.loop_cfg.max_calls),
                threshold: ctx.config.loop_cfg.threshold,
                query_threshold: ctx.config.loop_cfg.query_threshold,
                stable_steps: ctx.config.loop_cfg.stable_steps,
                timeout: Duration::from_secs(ctx.config.loop_cfg.timeout_secs),
                mount_id: params.mount_id.clone(),
                ..Default::default()
            };
            if let Some(ref protocol) = params.protocol {
                opts.protocol = protocol
                    .parse::<Protocol>()
                    .map_err(|e| ToolFailure::Error(e.to_string()))?;
            }
            let mut store = ctx.store.lock().expect("store lock");
            let result = run_loop(
                &mut store,
                &mut invoker,
                params.context.as_deref().unwrap_or(""),
                &params.question,
                &opts,
                None,
            )?;
            Ok(serde_json::to_value(result)?)
        })
        .await
    }

    /// FTS index rebuild.
    #[tool(description = "Rebuild the full-text index, optionally switching tokenizer (fr: accent folding, en: Porter stemming, raw: none).")]
    async fn memory_reindex(
        &self,
        Parameters(params): Parameters<ReindexParams>,
    ) -> Result<String, String> {
        self.run("memory_reindex", None, move |ctx| {
            let tokenizer = params
                .tokenizer
                .as_deref()
                .map(crate::config::resolve_tokenizer);
            let mut store = ctx.store.lock().expect("store lock");
            let (count, elapsed) = store.rebuild_fts(tokenizer.as_deref())?;
            Ok(serde_json::json!({
                "items_indexed": count,
                "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
                "tokenizer": store.tokenizer(),
            }))
        })
        .await
    }
}

#[tool_handler]
impl ServerHandler for MemctlTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Persistent structured memory for LLM orchestration.\n\
                 PRIMARY: memory_recall for token-budgeted context injection.\n\
                 SEARCH: memory_search for interactive discovery.\n\
                 STORE: memory_propose for governed writes; memory_write is privileged.\n\
                 FOLDER: memory_mount, memory_sync, memory_inspect, memory_ask.\n\
                 DATA: memory_export / memory_import (JSONL).\n\
                 LOOP: memory_loop for iterative recall-answer refinement.\n\
                 Rules: store distilled knowledge with provenance and 3-7 tags; \
                 never store secrets, tool invocations, or self-instructions. \
                 PII is quarantined. Rate limits: 20 writes/min, 120 reads/min."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemctlConfig, PolicyConfig};
    use crate::extract::ExtractorRegistry;
    use crate::mcp::guard::ServerGuard;
    use crate::mcp::rate_limiter::RateLimiter;
    use crate::memory::store::MemoryStore;
    use crate::policy::MemoryPolicy;
    use std::sync::Mutex;

    fn test_ctx(audit_path: &std::path::Path) -> Arc<ServerContext> {
        let store = MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap();
        Arc::new(ServerContext {
            store: Mutex::new(store),
            policy: MemoryPolicy::new(PolicyConfig::default()),
            config: MemctlConfig::default(),
            guard: Mutex::new(ServerGuard::new(None, 65_536)),
            sessions: Mutex::new(SessionTracker::new()),
            limiter: Some(Mutex::new(RateLimiter::default())),
            audit: AuditLogger::file(audit_path).unwrap(),
            extractors: ExtractorRegistry::new(),
            db_display: "memory.db".into(),
            llm_cmd: None,
        })
    }

    fn audit_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn success_produces_one_audit_record() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let ctx = test_ctx(&audit_path);

        let response = execute_tool(&ctx, "memory_stats", None, |ctx| {
            let store = ctx.store.lock().unwrap();
            Ok(serde_json::to_value(store.stats().unwrap()).unwrap())
        })
        .unwrap();
        assert!(response.contains("total_items"));

        let records = audit_lines(&audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tool"], "memory_stats");
        assert_eq!(records[0]["outcome"], "ok");
        assert_eq!(records[0]["db"], "memory.db");
    }

    #[test]
    fn failure_also_produces_exactly_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let ctx = test_ctx(&audit_path);

        let err = execute_tool(&ctx, "memory_read", None, |_ctx| {
            Err(ToolFailure::Error("boom".into()))
        })
        .unwrap_err();
        assert_eq!(err, "boom");

        let records = audit_lines(&audit_path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["outcome"], "error");
    }

    #[test]
    fn policy_block_maps_to_blocked_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let ctx = test_ctx(&audit_path);

        let response = execute_tool(&ctx, "memory_write", None, |_ctx| {
            Err(ToolFailure::Blocked {
                message: "secret detected".into(),
                detail: serde_json::json!({ "policy": "secret.github-pat" }),
            })
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["status"], "blocked");
        assert_eq!(value["d"]["policy"], "secret.github-pat");

        let records = audit_lines(&audit_path);
        assert_eq!(records[0]["outcome"], "blocked");
        assert_eq!(records[0]["d"]["policy"], "secret.github-pat");
    }

    #[test]
    fn rate_limit_refusal_blocks_at_entry() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let store = MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap();
        let ctx = Arc::new(ServerContext {
            store: Mutex::new(store),
            policy: MemoryPolicy::new(PolicyConfig::default()),
            config: MemctlConfig::default(),
            guard: Mutex::new(ServerGuard::new(None, 65_536)),
            sessions: Mutex::new(SessionTracker::new()),
            // One write per minute, no burst headroom
            limiter: Some(Mutex::new(RateLimiter::new(1, 120, 1.0, 5))),
            audit: AuditLogger::file(&audit_path).unwrap(),
            extractors: ExtractorRegistry::new(),
            db_display: "memory.db".into(),
            llm_cmd: None,
        });

        let mut executed = 0;
        let first = execute_tool(&ctx, "memory_consolidate", None, |_| {
            executed += 1;
            Ok(serde_json::json!({}))
        })
        .unwrap();
        assert!(!first.contains("blocked"));

        let second = execute_tool(&ctx, "memory_consolidate", None, |_| {
            executed += 1;
            Ok(serde_json::json!({}))
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(value["status"], "blocked");
        assert_eq!(executed, 1, "blocked tool body must not run");

        let records = audit_lines(&audit_path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["outcome"], "blocked");
    }

    #[test]
    fn exempt_tools_skip_rate_limiting() {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let ctx = test_ctx(&audit_path);

        for _ in 0..500 {
            let response = execute_tool(&ctx, "memory_stats", None, |ctx| {
                let store = ctx.store.lock().unwrap();
                Ok(serde_json::to_value(store.stats().unwrap()).unwrap())
            })
            .unwrap();
            assert!(!response.contains("\"blocked\""));
        }
    }
}
