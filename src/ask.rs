//! One-shot folder Q&A.
//!
//! Orchestrates auto-mount + auto-sync + structural inspect + scoped recall
//! + a bounded loop to answer a single question about a folder. Answer goes
//! to stdout, progress to stderr; no REPL.

use serde::Serialize;
use std::path::Path;

use crate::config::InspectConfig;
use crate::error::{MemctlError, Result};
use crate::extract::ExtractorRegistry;
use crate::format::format_injection_block;
use crate::inspect::{format_inspect_block, inspect_path, InspectOutcome, SyncMode};
use crate::llm::LlmInvoker;
use crate::memory::store::MemoryStore;
use crate::policy::MemoryPolicy;
use crate::query::{classify_mode, suggest_budget};
use crate::recall_loop::{run_loop, LoopAction, LoopOptions};

/// Result of an `ask` run.
#[derive(Debug, Serialize)]
pub struct AskResult {
    pub answer: String,
    pub mount_id: String,
    pub was_mounted: bool,
    pub was_synced: bool,
    pub recall_items_used: usize,
    pub loop_iterations: u32,
    pub converged: bool,
    pub stop_reason: LoopAction,
}

/// Tuning for one ask call.
pub struct AskOptions {
    pub sync_mode: SyncMode,
    /// Total token budget split between inspect and recall.
    pub budget_tokens: usize,
    /// Tokens reserved for the structural block.
    pub inspect_cap: usize,
    pub loop_opts: LoopOptions,
    pub max_chunk_chars: usize,
    /// Remove the auto-mount afterwards.
    pub ephemeral: bool,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Auto,
            budget_tokens: 2200,
            inspect_cap: 600,
            loop_opts: LoopOptions {
                protocol: crate::recall_loop::Protocol::Passive,
                max_calls: 1,
                ..Default::default()
            },
            max_chunk_chars: crate::ingest::DEFAULT_MAX_CHUNK_CHARS,
            ephemeral: false,
        }
    }
}

/// Answer a question about a folder's contents.
pub fn ask_folder(
    store: &mut MemoryStore,
    policy: &MemoryPolicy,
    extractors: &ExtractorRegistry,
    invoker: &mut dyn LlmInvoker,
    path: &Path,
    question: &str,
    inspect_config: &InspectConfig,
    opts: &AskOptions,
    log: &mut dyn FnMut(&str),
) -> Result<AskResult> {
    if opts.inspect_cap >= opts.budget_tokens {
        return Err(MemctlError::Validation(format!(
            "inspect cap ({}) must be less than the total budget ({})",
            opts.inspect_cap, opts.budget_tokens
        )));
    }

    let mode = classify_mode(question);
    let suggested = suggest_budget(question.chars().count());
    log(&format!(
        "[ask] mode={} suggested_budget={suggested}",
        mode.as_str()
    ));

    // Step 1: auto-mount + staleness-driven sync + digest.
    let outcome: InspectOutcome = inspect_path(
        store,
        policy,
        extractors,
        path,
        opts.sync_mode,
        inspect_config,
        opts.max_chunk_chars,
        log,
    )?;

    // Step 2: structural context under the inspect cap.
    let inspect_block = format_inspect_block(
        &outcome.stats,
        Some(&outcome.mount_label),
        opts.inspect_cap,
    );

    // Step 3: scoped recall under the remaining budget.
    let recall_budget = opts.budget_tokens - opts.inspect_cap;
    let items = store.recall_injectable(question, Some(&outcome.mount_id), 50)?;
    let recall_block = format_injection_block(&items, recall_budget, items.len(), "memory_recall");
    log(&format!(
        "[ask] context: {} chars inspect + {} chars recall ({} items)",
        inspect_block.chars().count(),
        recall_block.chars().count(),
        items.len()
    ));

    // Step 4: combined context.
    let combined = match (inspect_block.is_empty(), recall_block.is_empty()) {
        (false, false) => format!("{inspect_block}\n\n{recall_block}"),
        (false, true) => inspect_block,
        _ => recall_block,
    };

    // Step 5: bounded loop.
    let mut loop_opts = opts.loop_opts.clone();
    loop_opts.mount_id = Some(outcome.mount_id.clone());
    loop_opts.budget_tokens = opts.budget_tokens;
    let result = run_loop(store, invoker, &combined, question, &loop_opts, None)?;
    log(&format!(
        "[ask] {} iteration(s), stop={}, converged={}",
        result.iterations,
        result.stop_reason.as_str(),
        result.converged
    ));

    // Step 6: ephemeral cleanup.
    if opts.ephemeral {
        store.remove_mount(&outcome.mount_id)?;
        log("[ask] ephemeral: mount removed");
    }

    Ok(AskResult {
        answer: result.answer,
        mount_id: outcome.mount_id,
        was_mounted: outcome.was_mounted,
        was_synced: outcome.was_synced,
        recall_items_used: items.len(),
        loop_iterations: result.iterations,
        converged: result.converged,
        stop_reason: result.stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::llm::MockInvoker;

    #[test]
    fn ask_answers_with_context_from_folder() {
        let mut store = MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap();
        let policy = MemoryPolicy::new(PolicyConfig::default());
        let extractors = ExtractorRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("auth.md"),
            "# Auth\n\nSessions use signed cookies with a 24h expiry.",
        )
        .unwrap();

        let mut mock = MockInvoker::new(vec!["Sessions expire after 24 hours.".to_string()]);
        let result = ask_folder(
            &mut store,
            &policy,
            &extractors,
            &mut mock,
            dir.path(),
            "how do sessions expire",
            &InspectConfig::default(),
            &AskOptions::default(),
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(result.answer, "Sessions expire after 24 hours.");
        assert!(result.was_mounted);
        assert!(result.was_synced);
        assert_eq!(result.loop_iterations, 1);
        assert!(result.recall_items_used >= 1);

        // The mock received both the structural block and the recall block
        let prompt = &mock.prompts[0];
        assert!(prompt.contains("## Structure (Injected)"));
        assert!(prompt.contains("signed cookies"));
        assert!(prompt.contains("how do sessions expire"));
    }

    #[test]
    fn inspect_cap_must_fit_budget() {
        let mut store = MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap();
        let policy = MemoryPolicy::new(PolicyConfig::default());
        let extractors = ExtractorRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockInvoker::new(vec![]);

        let opts = AskOptions {
            inspect_cap: 3000,
            budget_tokens: 2200,
            ..Default::default()
        };
        let err = ask_folder(
            &mut store,
            &policy,
            &extractors,
            &mut mock,
            dir.path(),
            "q",
            &InspectConfig::default(),
            &opts,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, MemctlError::Validation(_)));
    }

    #[test]
    fn ephemeral_mount_is_removed() {
        let mut store = MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap();
        let policy = MemoryPolicy::new(PolicyConfig::default());
        let extractors = ExtractorRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "content").unwrap();

        let mut mock = MockInvoker::new(vec!["answer".to_string()]);
        let opts = AskOptions {
            ephemeral: true,
            ..Default::default()
        };
        let result = ask_folder(
            &mut store,
            &policy,
            &extractors,
            &mut mock,
            dir.path(),
            "q",
            &InspectConfig::default(),
            &opts,
            &mut |_| {},
        )
        .unwrap();

        assert!(store.read_mount(&result.mount_id).unwrap().is_none());
    }
}
