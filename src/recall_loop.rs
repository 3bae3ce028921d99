//! The bounded recall-answer loop controller.
//!
//! Binds an external LLM to the memory store for iterative refinement. The
//! LLM only proposes queries; the controller enforces bounds, context
//! deduplication, and the five stopping conditions: `llm_stop`,
//! `fixed_point`, `query_cycle`, `no_new_items`, and `max_calls`. Every
//! iteration emits a JSONL trace record; traces are replayable without
//! invoking any LLM.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::{Duration, Instant};

use crate::error::{MemctlError, Result};
use crate::llm::LlmInvoker;
use crate::memory::store::MemoryStore;
use crate::memory::types::{EventAction, MemoryItem};
use crate::similarity::{is_fixed_point, is_query_cycle, similarity};

/// Protocol instructions prepended to every call in json mode.
pub const PROTOCOL_SYSTEM_PROMPT: &str = "\
You are answering a question using retrieved context. Follow this protocol exactly:

1. Your FIRST line of output MUST be a JSON object with these fields:
   {\"need_more\": <bool>, \"query\": \"<string or null>\", \"rationale\": \"<string or null>\", \"stop\": <bool>}

2. After the JSON line, leave ONE blank line, then write your answer.

3. If the provided context is SUFFICIENT to answer fully:
   {\"need_more\": false, \"query\": null, \"rationale\": null, \"stop\": true}

4. If the provided context is INSUFFICIENT and you need more information:
   {\"need_more\": true, \"query\": \"specific refined search query\", \"rationale\": \"what is missing\", \"stop\": false}

5. Do NOT emit anything before the JSON line. Do NOT wrap it in markdown.";

/// How the LLM expresses refinement directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// JSON envelope on the first output line.
    Json,
    /// Single-line `QUERY: …` directive anywhere in the output.
    Regex,
    /// No refinement: exactly one iteration.
    Passive,
}

impl std::str::FromStr for Protocol {
    type Err = MemctlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "regex" => Ok(Self::Regex),
            "passive" => Ok(Self::Passive),
            _ => Err(MemctlError::Validation(format!(
                "unknown protocol {s:?}: expected json|regex|passive"
            ))),
        }
    }
}

/// Parsed refinement directive.
#[derive(Debug, Clone, Default)]
pub struct Directive {
    pub need_more: bool,
    pub query: Option<String>,
    pub rationale: Option<String>,
    pub stop: bool,
}

impl Directive {
    fn stop_now() -> Self {
        Self {
            stop: true,
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
struct JsonEnvelope {
    #[serde(default)]
    need_more: bool,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    stop: bool,
}

/// Parse the LLM output per protocol into (directive, answer).
pub fn parse_directive(output: &str, protocol: Protocol, strict: bool) -> Result<(Directive, String)> {
    match protocol {
        Protocol::Json => parse_json_directive(output, strict),
        Protocol::Regex => Ok(parse_regex_directive(output)),
        Protocol::Passive => Ok((Directive::stop_now(), output.to_string())),
    }
}

fn parse_json_directive(output: &str, strict: bool) -> Result<(Directive, String)> {
    let (first_line, rest) = match output.split_once('\n') {
        Some((first, rest)) => (first.trim(), rest.trim_start_matches('\n')),
        None => (output.trim(), ""),
    };

    match serde_json::from_str::<JsonEnvelope>(first_line) {
        Ok(envelope) => {
            let mut directive = Directive {
                need_more: envelope.need_more,
                query: envelope.query,
                rationale: envelope.rationale,
                stop: envelope.stop,
            };
            // An empty refinement query with need_more means stop.
            if directive.need_more
                && directive
                    .query
                    .as_deref()
                    .map(|q| q.trim().is_empty())
                    .unwrap_or(true)
            {
                directive.need_more = false;
                directive.stop = true;
            }
            Ok((directive, rest.to_string()))
        }
        Err(e) => {
            if strict {
                return Err(MemctlError::Validation(format!(
                    "invalid JSON protocol line {first_line:?}: {e}"
                )));
            }
            // Lenient: whole output is the answer, no refinement.
            Ok((Directive::stop_now(), output.to_string()))
        }
    }
}

fn parse_regex_directive(output: &str) -> (Directive, String) {
    use regex::Regex;
    use std::sync::LazyLock;
    static QUERY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?im)^QUERY\s*:\s*(.+)$").unwrap());

    if let Some(captures) = QUERY_RE.captures(output) {
        let query = captures.get(1).unwrap().as_str().trim().to_string();
        let need_more = !query.is_empty();
        return (
            Directive {
                need_more,
                query: Some(query),
                rationale: None,
                stop: !need_more,
            },
            output.to_string(),
        );
    }
    (Directive::stop_now(), output.to_string())
}

/// The five stopping conditions plus `continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    Continue,
    LlmStop,
    FixedPoint,
    QueryCycle,
    NoNewItems,
    MaxCalls,
}

impl LoopAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::LlmStop => "llm_stop",
            Self::FixedPoint => "fixed_point",
            Self::QueryCycle => "query_cycle",
            Self::NoNewItems => "no_new_items",
            Self::MaxCalls => "max_calls",
        }
    }
}

/// One JSONL trace record per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub iter: u32,
    pub query: Option<String>,
    pub new_items: usize,
    #[serde(default)]
    pub new_item_ids: Vec<String>,
    pub sim: Option<f64>,
    pub action: LoopAction,
    /// True when the iteration ended on a timeout rather than a model call.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    /// Final answer, carried on the terminal record only (replay needs it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Final result of a loop run.
#[derive(Debug, Serialize)]
pub struct LoopResult {
    pub answer: String,
    pub iterations: u32,
    pub converged: bool,
    pub stop_reason: LoopAction,
    pub timed_out: bool,
    pub traces: Vec<TraceRecord>,
}

/// Loop tuning knobs.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_calls: u32,
    pub threshold: f64,
    pub query_threshold: f64,
    pub stable_steps: u32,
    pub stop_on_no_new: bool,
    pub protocol: Protocol,
    pub strict: bool,
    pub budget_tokens: usize,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
    /// Optional overall deadline across all iterations.
    pub deadline: Option<Duration>,
    pub mount_id: Option<String>,
    pub recall_limit: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_calls: 3,
            threshold: 0.92,
            query_threshold: 0.90,
            stable_steps: 2,
            stop_on_no_new: true,
            protocol: Protocol::Json,
            strict: false,
            budget_tokens: 2200,
            system_prompt: None,
            timeout: Duration::from_secs(300),
            deadline: None,
            mount_id: None,
            recall_limit: 50,
        }
    }
}

/// Assemble the full prompt: protocol instructions + user system prompt +
/// context + question.
pub fn build_prompt(
    context: &str,
    query: &str,
    system_prompt: Option<&str>,
    protocol: Protocol,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if protocol == Protocol::Json {
        parts.push(PROTOCOL_SYSTEM_PROMPT.to_string());
        parts.push(String::new());
    }
    if let Some(sp) = system_prompt {
        parts.push(sp.to_string());
        parts.push(String::new());
    }
    if !context.trim().is_empty() {
        parts.push("## Context".into());
        parts.push(context.trim().to_string());
        parts.push(String::new());
    }
    parts.push("## Question".into());
    parts.push(query.to_string());
    parts.join("\n")
}

/// Merge new recall items into the context with id-dedup and a character
/// budget. Returns (merged context, ids actually added).
pub fn merge_context(
    existing: &str,
    new_items: &[MemoryItem],
    seen_ids: &mut std::collections::HashSet<String>,
    budget_chars: usize,
) -> (String, Vec<String>) {
    let truly_new: Vec<&MemoryItem> = new_items
        .iter()
        .filter(|item| !seen_ids.contains(&item.id))
        .collect();
    if truly_new.is_empty() {
        return (existing.to_string(), Vec::new());
    }

    let mut added = Vec::new();
    let mut blocks = Vec::new();
    for item in truly_new {
        blocks.push(format!("[{}]\n{}", item.title, item.content));
        seen_ids.insert(item.id.clone());
        added.push(item.id.clone());
    }
    let new_text = blocks.join("\n\n");

    let mut merged = if existing.trim().is_empty() {
        new_text
    } else {
        format!("{}\n\n{new_text}", existing.trim_end())
    };

    // Earlier context has priority: trim the tail, never mid-word.
    if merged.chars().count() > budget_chars {
        let mut truncated: String = merged.chars().take(budget_chars).collect();
        if let Some(last_space) = truncated.rfind(' ') {
            if last_space > budget_chars * 4 / 5 {
                truncated.truncate(last_space);
            }
        }
        merged = truncated;
    }

    (merged, added)
}

/// Emit one trace record as a JSONL line.
fn emit_trace(record: &TraceRecord, sink: &mut Option<&mut dyn Write>) -> Result<()> {
    if let Some(out) = sink.as_mut() {
        serde_json::to_writer(&mut **out, record)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

/// Run the bounded recall-answer loop.
pub fn run_loop(
    store: &mut MemoryStore,
    invoker: &mut dyn LlmInvoker,
    initial_context: &str,
    question: &str,
    opts: &LoopOptions,
    mut trace_sink: Option<&mut dyn Write>,
) -> Result<LoopResult> {
    let budget_chars = opts.budget_tokens * 4;
    let started = Instant::now();
    let mut context = initial_context.to_string();
    let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut query_history: Vec<String> = vec![question.to_string()];
    let mut answers: Vec<String> = Vec::new();
    let mut traces: Vec<TraceRecord> = Vec::new();
    let mut consecutive_stable: u32 = 0;
    let mut current_query = question.to_string();

    let max_calls = if opts.protocol == Protocol::Passive {
        1
    } else {
        opts.max_calls.max(1)
    };

    for iteration in 1..=max_calls {
        // Per-iteration timeout, clipped to the remaining overall deadline.
        let mut timeout = opts.timeout;
        if let Some(deadline) = opts.deadline {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return finish_timeout(store, iteration, answers, traces, &mut trace_sink);
            }
            timeout = timeout.min(remaining);
        }

        let prompt = build_prompt(
            &context,
            &current_query,
            opts.system_prompt.as_deref(),
            opts.protocol,
        );
        let llm_output = match invoker.invoke(&prompt, timeout) {
            Ok(output) => output,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "LLM call timed out");
                return finish_timeout(store, iteration, answers, traces, &mut trace_sink);
            }
            Err(e) => return Err(e),
        };

        let (directive, answer) = parse_directive(&llm_output, opts.protocol, opts.strict)?;
        answers.push(answer.clone());

        // Fixed-point test from the second answer onward.
        let mut sim = None;
        if answers.len() >= 2 {
            let s = similarity(&answers[answers.len() - 1], &answers[answers.len() - 2]);
            sim = Some((s * 10_000.0).round() / 10_000.0);
            if is_fixed_point(
                &answers[answers.len() - 1],
                &answers[answers.len() - 2],
                opts.threshold,
            ) {
                consecutive_stable += 1;
            } else {
                consecutive_stable = 0;
            }
        }

        // Deterministic stop-condition ladder; the LLM only proposes.
        let mut action = LoopAction::Continue;
        if directive.stop || !directive.need_more {
            action = LoopAction::LlmStop;
        } else if consecutive_stable >= opts.stable_steps {
            action = LoopAction::FixedPoint;
        } else if directive
            .query
            .as_deref()
            .map(|q| is_query_cycle(q, &query_history, opts.query_threshold))
            .unwrap_or(false)
        {
            action = LoopAction::QueryCycle;
        } else if iteration == max_calls {
            action = LoopAction::MaxCalls;
        }

        // Recall for the next iteration.
        let mut new_item_ids = Vec::new();
        if action == LoopAction::Continue {
            if let Some(ref query) = directive.query {
                let items =
                    store.recall_injectable(query, opts.mount_id.as_deref(), opts.recall_limit)?;
                let (merged, added) = merge_context(&context, &items, &mut seen_ids, budget_chars);
                context = merged;
                new_item_ids = added;

                if new_item_ids.is_empty() && opts.stop_on_no_new {
                    action = LoopAction::NoNewItems;
                }
                query_history.push(query.clone());
                current_query = query.clone();
            }
        }

        let terminal = action != LoopAction::Continue;
        let record = TraceRecord {
            iter: iteration,
            query: directive.need_more.then(|| directive.query.clone()).flatten(),
            new_items: new_item_ids.len(),
            new_item_ids,
            sim,
            action,
            timed_out: false,
            answer: terminal.then(|| answer.clone()),
        };
        emit_trace(&record, &mut trace_sink)?;
        store.log_event(
            EventAction::LoopIter,
            None,
            serde_json::json!({
                "iter": record.iter,
                "action": record.action.as_str(),
                "new_items": record.new_items,
                "sim": record.sim,
            }),
            "",
        )?;
        traces.push(record);

        if terminal {
            let converged = matches!(action, LoopAction::FixedPoint | LoopAction::LlmStop);
            return Ok(LoopResult {
                answer,
                iterations: iteration,
                converged,
                stop_reason: action,
                timed_out: false,
                traces,
            });
        }
    }

    // max_calls is handled inside the loop; this is unreachable in practice.
    Ok(LoopResult {
        answer: answers.last().cloned().unwrap_or_default(),
        iterations: max_calls,
        converged: false,
        stop_reason: LoopAction::MaxCalls,
        timed_out: false,
        traces,
    })
}

fn finish_timeout(
    store: &mut MemoryStore,
    iteration: u32,
    answers: Vec<String>,
    mut traces: Vec<TraceRecord>,
    trace_sink: &mut Option<&mut dyn Write>,
) -> Result<LoopResult> {
    let answer = answers.last().cloned().unwrap_or_default();
    let record = TraceRecord {
        iter: iteration,
        query: None,
        new_items: 0,
        new_item_ids: Vec::new(),
        sim: None,
        action: LoopAction::MaxCalls,
        timed_out: true,
        answer: Some(answer.clone()),
    };
    emit_trace(&record, trace_sink)?;
    store.log_event(
        EventAction::LoopIter,
        None,
        serde_json::json!({ "iter": iteration, "action": "max_calls", "timed_out": true }),
        "",
    )?;
    traces.push(record);
    Ok(LoopResult {
        answer,
        iterations: iteration,
        converged: false,
        stop_reason: LoopAction::MaxCalls,
        timed_out: true,
        traces,
    })
}

/// Parse a JSONL trace file.
pub fn read_trace(path: &std::path::Path) -> Result<Vec<TraceRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

/// Replay a trace without invoking any LLM: re-run each recorded recall and
/// assert it reproduces the recorded item sets, then return the recorded
/// final answer.
pub fn replay_loop(
    store: &mut MemoryStore,
    trace_path: &std::path::Path,
    mount_id: Option<&str>,
    recall_limit: usize,
) -> Result<LoopResult> {
    let records = read_trace(trace_path)?;
    if records.is_empty() {
        return Err(MemctlError::Validation("empty trace file".into()));
    }

    let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    for record in &records {
        let Some(ref query) = record.query else {
            continue;
        };
        let items = store.recall_injectable(query, mount_id, recall_limit)?;
        let fresh: std::collections::HashSet<String> = items
            .iter()
            .map(|it| it.id.clone())
            .filter(|id| !seen_ids.contains(id))
            .collect();
        let recorded: std::collections::HashSet<String> =
            record.new_item_ids.iter().cloned().collect();
        if fresh != recorded {
            return Err(MemctlError::Validation(format!(
                "replay divergence at iter {}: recall returned a different item set",
                record.iter
            )));
        }
        seen_ids.extend(fresh);
    }

    let terminal = records.last().unwrap();
    let answer = terminal.answer.clone().ok_or_else(|| {
        MemctlError::Validation("trace has no terminal answer to replay".into())
    })?;

    Ok(LoopResult {
        answer,
        iterations: terminal.iter,
        converged: matches!(terminal.action, LoopAction::FixedPoint | LoopAction::LlmStop),
        stop_reason: terminal.action,
        timed_out: terminal.timed_out,
        traces: records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockInvoker;

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap()
    }

    fn store_with_items(contents: &[&str]) -> MemoryStore {
        let mut store = test_store();
        for (i, content) in contents.iter().enumerate() {
            let mut item = MemoryItem::new(format!("seed {i}"), *content);
            item.provenance.source_id = "seed".into();
            store.write_item(&mut item, "create").unwrap();
        }
        store
    }

    fn envelope(need_more: bool, query: Option<&str>, stop: bool, answer: &str) -> String {
        let query_json = match query {
            Some(q) => format!("\"{q}\""),
            None => "null".into(),
        };
        format!(
            "{{\"need_more\": {need_more}, \"query\": {query_json}, \"rationale\": null, \"stop\": {stop}}}\n\n{answer}"
        )
    }

    #[test]
    fn json_directive_parses_envelope_and_answer() {
        let output = envelope(true, Some("refined query"), false, "the body");
        let (directive, answer) = parse_directive(&output, Protocol::Json, false).unwrap();
        assert!(directive.need_more);
        assert_eq!(directive.query.as_deref(), Some("refined query"));
        assert!(!directive.stop);
        assert_eq!(answer, "the body");
    }

    #[test]
    fn json_invalid_first_line_lenient_vs_strict() {
        let output = "not json at all\nanswer body";
        let (directive, answer) = parse_directive(output, Protocol::Json, false).unwrap();
        assert!(directive.stop);
        assert_eq!(answer, output);

        assert!(parse_directive(output, Protocol::Json, true).is_err());
    }

    #[test]
    fn json_need_more_without_query_stops() {
        let output = "{\"need_more\": true, \"query\": \"  \", \"stop\": false}\n\nanswer";
        let (directive, _) = parse_directive(output, Protocol::Json, false).unwrap();
        assert!(!directive.need_more);
        assert!(directive.stop);
    }

    #[test]
    fn regex_directive_finds_query_line() {
        let output = "Some answer text.\nQUERY: more about tokenizers\nmore text";
        let (directive, answer) = parse_directive(output, Protocol::Regex, false).unwrap();
        assert!(directive.need_more);
        assert_eq!(directive.query.as_deref(), Some("more about tokenizers"));
        assert_eq!(answer, output);
    }

    #[test]
    fn passive_always_stops() {
        let (directive, answer) =
            parse_directive("just an answer", Protocol::Passive, false).unwrap();
        assert!(directive.stop);
        assert_eq!(answer, "just an answer");
    }

    #[test]
    fn llm_stop_ends_after_one_call() {
        let mut store = test_store();
        let mut mock = MockInvoker::new(vec![envelope(false, None, true, "final answer")]);
        let result = run_loop(
            &mut store,
            &mut mock,
            "",
            "question?",
            &LoopOptions::default(),
            None,
        )
        .unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.stop_reason, LoopAction::LlmStop);
        assert!(result.converged);
        assert_eq!(result.answer, "final answer");
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn fixed_point_stops_on_stable_answers() {
        // Three identical answers: similarity hits 1.0 at iterations 2
        // and 3, giving two consecutive stable pairs with stable_steps=2.
        let mut store = store_with_items(&["alpha knowledge", "beta knowledge"]);
        let answers = vec![
            envelope(true, Some("alpha knowledge"), false, "the stable answer"),
            envelope(true, Some("beta knowledge"), false, "the stable answer"),
            envelope(true, Some("gamma knowledge"), false, "the stable answer"),
            envelope(true, Some("delta knowledge"), false, "the stable answer"),
            envelope(false, None, true, "never reached"),
        ];
        let mut mock = MockInvoker::new(answers);
        let opts = LoopOptions {
            max_calls: 5,
            stable_steps: 2,
            stop_on_no_new: false,
            ..Default::default()
        };
        let result = run_loop(&mut store, &mut mock, "", "q", &opts, None).unwrap();
        assert_eq!(result.stop_reason, LoopAction::FixedPoint);
        assert_eq!(result.iterations, 3);
        assert!(result.converged);
        assert!(result.iterations < 5, "fixed point must use fewer than max_calls");
        assert_eq!(result.traces.last().unwrap().action, LoopAction::FixedPoint);
    }

    #[test]
    fn query_cycle_detected() {
        let mut store = store_with_items(&["alpha knowledge", "beta knowledge"]);
        let answers = vec![
            envelope(true, Some("alpha knowledge"), false, "first answer"),
            envelope(true, Some("alpha knowledge"), false, "totally different second"),
        ];
        let mut mock = MockInvoker::new(answers);
        let opts = LoopOptions {
            max_calls: 5,
            stop_on_no_new: false,
            ..Default::default()
        };
        let result = run_loop(&mut store, &mut mock, "", "q", &opts, None).unwrap();
        assert_eq!(result.stop_reason, LoopAction::QueryCycle);
        assert_eq!(result.iterations, 2);
        assert!(!result.converged);
    }

    #[test]
    fn no_new_items_stops() {
        let mut store = test_store(); // empty store: recall finds nothing
        let answers = vec![envelope(true, Some("anything at all"), false, "answer one")];
        let mut mock = MockInvoker::new(answers);
        let result = run_loop(
            &mut store,
            &mut mock,
            "",
            "q",
            &LoopOptions::default(),
            None,
        )
        .unwrap();
        assert_eq!(result.stop_reason, LoopAction::NoNewItems);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn max_calls_bounds_the_loop() {
        let mut store = store_with_items(&[
            "alpha knowledge one",
            "beta knowledge two",
            "gamma knowledge three",
        ]);
        let answers = vec![
            envelope(true, Some("alpha"), false, "answer one entirely about alpha"),
            envelope(true, Some("beta"), false, "answer two entirely about beta things"),
            envelope(true, Some("gamma"), false, "answer three entirely about gamma"),
        ];
        let mut mock = MockInvoker::new(answers);
        let opts = LoopOptions {
            max_calls: 3,
            stop_on_no_new: false,
            ..Default::default()
        };
        let result = run_loop(&mut store, &mut mock, "", "q", &opts, None).unwrap();
        assert_eq!(result.stop_reason, LoopAction::MaxCalls);
        assert_eq!(result.iterations, 3);
        assert_eq!(mock.calls(), 3, "never more than max_calls invocations");
    }

    #[test]
    fn passive_runs_exactly_once() {
        let mut store = test_store();
        let mut mock = MockInvoker::new(vec!["plain answer".to_string()]);
        let opts = LoopOptions {
            protocol: Protocol::Passive,
            max_calls: 5,
            ..Default::default()
        };
        let result = run_loop(&mut store, &mut mock, "ctx", "q", &opts, None).unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.answer, "plain answer");
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn merge_context_dedups_and_budgets() {
        let mut seen = std::collections::HashSet::new();
        let mut a = MemoryItem::new("T1", "content one");
        a.id = "MEM-1".into();
        let mut b = MemoryItem::new("T2", "content two");
        b.id = "MEM-2".into();

        let (ctx, added) = merge_context("", &[a.clone(), b.clone()], &mut seen, 10_000);
        assert_eq!(added.len(), 2);
        assert!(ctx.contains("content one"));

        // Same items again: nothing new
        let (ctx2, added2) = merge_context(&ctx, &[a, b], &mut seen, 10_000);
        assert!(added2.is_empty());
        assert_eq!(ctx2, ctx);
    }

    #[test]
    fn trace_emission_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("trace.jsonl");

        let mut store = store_with_items(&["alpha knowledge", "beta knowledge"]);
        let answers = vec![
            envelope(true, Some("alpha knowledge"), false, "draft answer"),
            envelope(false, None, true, "final replayable answer"),
        ];
        let mut mock = MockInvoker::new(answers);
        let opts = LoopOptions {
            stop_on_no_new: false,
            ..Default::default()
        };

        {
            let mut file = std::fs::File::create(&trace_path).unwrap();
            let result =
                run_loop(&mut store, &mut mock, "", "q", &opts, Some(&mut file)).unwrap();
            assert_eq!(result.answer, "final replayable answer");
        }

        // Replay reproduces the answer without any LLM.
        let replayed = replay_loop(&mut store, &trace_path, None, 50).unwrap();
        assert_eq!(replayed.answer, "final replayable answer");
        assert_eq!(replayed.stop_reason, LoopAction::LlmStop);
    }

    #[test]
    fn replay_detects_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("trace.jsonl");

        let mut store = store_with_items(&["alpha knowledge"]);
        let answers = vec![
            envelope(true, Some("alpha knowledge"), false, "draft"),
            envelope(false, None, true, "done"),
        ];
        let mut mock = MockInvoker::new(answers);
        let opts = LoopOptions {
            stop_on_no_new: false,
            ..Default::default()
        };
        {
            let mut file = std::fs::File::create(&trace_path).unwrap();
            run_loop(&mut store, &mut mock, "", "q", &opts, Some(&mut file)).unwrap();
        }

        // Change the store: the recorded recall no longer reproduces.
        let mut extra = MemoryItem::new("new", "alpha knowledge refreshed");
        extra.provenance.source_id = "seed".into();
        store.write_item(&mut extra, "create").unwrap();

        let err = replay_loop(&mut store, &trace_path, None, 50).unwrap_err();
        assert!(err.to_string().contains("divergence"));
    }

    #[test]
    fn deadline_reports_timeout_max_calls() {
        let mut store = test_store();
        let mut mock = MockInvoker::new(vec![envelope(false, None, true, "unused")]);
        let opts = LoopOptions {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        };
        let result = run_loop(&mut store, &mut mock, "", "q", &opts, None).unwrap();
        assert_eq!(result.stop_reason, LoopAction::MaxCalls);
        assert!(result.timed_out);
        assert_eq!(mock.calls(), 0);
        assert!(result.traces.last().unwrap().timed_out);
    }
}
