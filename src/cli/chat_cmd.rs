use std::io::Read;

use super::{CliContext, CmdResult};
use memctl::chat::{chat_turn, ChatOptions};
use memctl::config::resolve_budget;
use memctl::error::MemctlError;
use memctl::llm::{PromptMode, SubprocessInvoker};
use memctl::mount::find_mount;

/// One memory-backed chat turn. The question comes from the argument or
/// stdin; the answer goes to stdout.
pub fn run(
    ctx: &CliContext,
    question: Option<&str>,
    llm: Option<&str>,
    mount: Option<&str>,
    persist: bool,
    session: Option<&str>,
    budget: Option<usize>,
) -> CmdResult {
    let llm_cmd = llm.ok_or_else(|| {
        MemctlError::Validation("--llm is required (e.g. --llm 'claude -p')".into())
    })?;

    let question = match question {
        Some(q) => q.to_string(),
        None => {
            let mut buf = String::new();
            std::io::stdin().lock().read_to_string(&mut buf)?;
            buf.trim().to_string()
        }
    };
    if question.is_empty() {
        return Err(MemctlError::Validation("empty question".into()).into());
    }

    let mut store = ctx.open_store()?;
    let policy = ctx.policy();
    let mut invoker = SubprocessInvoker::new(llm_cmd, PromptMode::Stdin)?;

    let mount_id = match mount {
        Some(key) => Some(
            find_mount(&store, key)?
                .ok_or_else(|| MemctlError::Validation(format!("unknown mount: {key}")))?
                .mount_id,
        ),
        None => None,
    };

    let opts = ChatOptions {
        budget_tokens: resolve_budget(budget),
        mount_id,
        persist,
        session_id: session.map(str::to_string),
        ..Default::default()
    };

    let result = chat_turn(&mut store, &policy, &mut invoker, None, &question, &opts)?;

    ctx.progress(&format!(
        "[chat] {} item(s) recalled{}",
        result.recalled_items,
        result
            .stored_id
            .as_deref()
            .map(|id| format!(", answer stored as {id}"))
            .unwrap_or_default()
    ));
    println!("{}", result.answer);
    Ok(0)
}
