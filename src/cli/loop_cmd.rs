use std::path::PathBuf;
use std::time::Duration;

use super::{CliContext, CmdResult};
use memctl::config::resolve_budget;
use memctl::error::MemctlError;
use memctl::llm::{PromptMode, SubprocessInvoker};
use memctl::mount::find_mount;
use memctl::recall_loop::{replay_loop, run_loop, LoopOptions, Protocol};

pub struct LoopCmdArgs {
    pub question: String,
    pub llm: Option<String>,
    pub protocol: String,
    pub llm_mode: String,
    pub max_calls: Option<u32>,
    pub budget: Option<usize>,
    pub mount: Option<String>,
    pub trace: Option<PathBuf>,
    pub replay: Option<PathBuf>,
    pub strict: bool,
    pub timeout: u64,
}

/// Run (or replay) the bounded recall-answer loop. The initial context is
/// read from stdin when piped.
pub fn run(ctx: &CliContext, args: LoopCmdArgs) -> CmdResult {
    let mut store = ctx.open_store()?;

    let mount_id = match args.mount {
        Some(ref key) => Some(
            find_mount(&store, key)?
                .ok_or_else(|| MemctlError::Validation(format!("unknown mount: {key}")))?
                .mount_id,
        ),
        None => None,
    };

    // Replay mode: no LLM involved.
    if let Some(ref trace_path) = args.replay {
        let result = replay_loop(&mut store, trace_path, mount_id.as_deref(), 50)?;
        ctx.progress(&format!(
            "[loop] replayed {} iteration(s), stop={}",
            result.iterations,
            result.stop_reason.as_str()
        ));
        println!("{}", result.answer);
        return Ok(0);
    }

    let llm_cmd = args
        .llm
        .ok_or_else(|| MemctlError::Validation("--llm is required (e.g. --llm 'claude -p')".into()))?;
    let mode: PromptMode = args.llm_mode.parse()?;
    let mut invoker = SubprocessInvoker::new(&llm_cmd, mode)?;

    // Initial context arrives on stdin when piped.
    let initial_context = if atty_stdin_is_piped() {
        let mut buf = String::new();
        use std::io::Read;
        std::io::stdin().lock().read_to_string(&mut buf)?;
        buf
    } else {
        String::new()
    };

    let opts = LoopOptions {
        max_calls: args.max_calls.unwrap_or(ctx.config.loop_cfg.max_calls),
        threshold: ctx.config.loop_cfg.threshold,
        query_threshold: ctx.config.loop_cfg.query_threshold,
        stable_steps: ctx.config.loop_cfg.stable_steps,
        protocol: args.protocol.parse::<Protocol>()?,
        strict: args.strict,
        budget_tokens: resolve_budget(args.budget),
        timeout: Duration::from_secs(args.timeout),
        mount_id,
        ..Default::default()
    };

    let mut trace_file = match args.trace {
        Some(ref path) => Some(std::fs::File::create(path)?),
        None => None,
    };
    let trace_sink: Option<&mut dyn std::io::Write> = match trace_file.as_mut() {
        Some(file) => Some(file),
        None => None,
    };

    let result = run_loop(
        &mut store,
        &mut invoker,
        &initial_context,
        &args.question,
        &opts,
        trace_sink,
    )?;

    ctx.progress(&format!(
        "[loop] {} iteration(s), stop={}, converged={}{}",
        result.iterations,
        result.stop_reason.as_str(),
        result.converged,
        if result.timed_out { " (timed out)" } else { "" }
    ));
    println!("{}", result.answer);
    Ok(0)
}

/// True when stdin is a pipe rather than a terminal.
fn atty_stdin_is_piped() -> bool {
    use std::io::IsTerminal;
    !std::io::stdin().is_terminal()
}
