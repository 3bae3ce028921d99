use std::path::Path;

use super::{CliContext, CmdResult};
use memctl::ask::{ask_folder, AskOptions};
use memctl::config::resolve_budget;
use memctl::error::MemctlError;
use memctl::inspect::SyncMode;
use memctl::llm::{PromptMode, SubprocessInvoker};

/// One-shot folder Q&A: answer to stdout, progress to stderr.
#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &CliContext,
    path: &Path,
    question: &str,
    llm: Option<&str>,
    budget: Option<usize>,
    inspect_cap: usize,
    sync: &str,
    ephemeral: bool,
) -> CmdResult {
    let llm_cmd = llm.ok_or_else(|| {
        MemctlError::Validation("--llm is required (e.g. --llm 'claude -p')".into())
    })?;
    let mut store = ctx.open_store()?;
    let policy = ctx.policy();
    let extractors = ctx.extractors();
    let mut invoker = SubprocessInvoker::new(llm_cmd, PromptMode::Stdin)?;

    let opts = AskOptions {
        sync_mode: sync.parse::<SyncMode>()?,
        budget_tokens: resolve_budget(budget),
        inspect_cap,
        ephemeral,
        ..Default::default()
    };

    let quiet = ctx.quiet;
    let result = ask_folder(
        &mut store,
        &policy,
        &extractors,
        &mut invoker,
        path,
        question,
        &ctx.config.inspect,
        &opts,
        &mut |msg| {
            if !quiet {
                eprintln!("{msg}");
            }
        },
    )?;

    if ctx.json {
        ctx.emit(&result, String::new);
    } else {
        println!("{}", result.answer);
    }
    Ok(0)
}
