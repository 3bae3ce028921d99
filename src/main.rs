mod cli;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memctl::error::MemctlError;

#[derive(Parser)]
#[command(
    name = "memctl",
    version,
    about = "Persistent, policy-governed memory for LLM workflows"
)]
struct Cli {
    /// SQLite database path (default: .memory/memory.db or $MEMCTL_DB).
    #[arg(long, global = true)]
    db: Option<String>,

    /// Config file path (default: config.json next to the database).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON on stdout instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    /// Suppress progress output on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a memory workspace.
    Init,
    /// Ingest files, directories, or globs into memory.
    Push(PushArgs),
    /// Store stdin content into memory through the policy engine.
    Pull(PullArgs),
    /// Search memory items through the FTS cascade.
    Search(SearchArgs),
    /// Show one memory item, optionally with its revision chain.
    Show(ShowArgs),
    /// Store statistics.
    Stats,
    /// Run deterministic STM→MTM→LTM consolidation.
    Consolidate(ConsolidateArgs),
    /// Run the bounded recall-answer loop against an external LLM.
    Loop(LoopArgs),
    /// Manage folder mounts.
    Mount(MountArgs),
    /// Sync mounted folders (3-tier delta detection).
    Sync(SyncArgs),
    /// Structural inspection of a folder or the whole corpus.
    Inspect(InspectArgs),
    /// One-shot folder Q&A.
    Ask(AskArgs),
    /// Memory-backed chat turns.
    Chat(ChatArgs),
    /// Export items as JSONL to stdout.
    Export(ExportArgs),
    /// Import items from JSONL (file or stdin) through the policy engine.
    Import(ImportArgs),
    /// Start the MCP server (stdio transport).
    Serve(ServeArgs),
    /// Rebuild the FTS index, optionally switching tokenizer.
    Reindex(ReindexArgs),
}

#[derive(Args)]
struct PushArgs {
    /// Files, directories, or glob patterns ("-" reads stdin).
    #[arg(required = true)]
    sources: Vec<String>,
    /// Memory scope for created items.
    #[arg(long, default_value = "project")]
    scope: String,
    /// Extra tags attached to every chunk.
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
    /// Re-ingest files even when their stored hash matches.
    #[arg(long)]
    full: bool,
    /// Store chunks as non-injectable (searchable only).
    #[arg(long)]
    no_inject: bool,
}

#[derive(Args)]
struct PullArgs {
    /// Title for the stored content.
    #[arg(long)]
    title: Option<String>,
    /// Memory scope.
    #[arg(long, default_value = "project")]
    scope: String,
    /// Tags for the stored content.
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

#[derive(Args)]
struct SearchArgs {
    query: String,
    /// Filter by tier (stm|mtm|ltm), or $MEMCTL_TIER.
    #[arg(long, env = "MEMCTL_TIER")]
    tier: Option<String>,
    /// Filter by item type.
    #[arg(long = "type")]
    type_filter: Option<String>,
    /// Filter by scope.
    #[arg(long)]
    scope: Option<String>,
    /// Maximum results.
    #[arg(short = 'k', long, default_value_t = 10)]
    limit: usize,
}

#[derive(Args)]
struct ShowArgs {
    /// Item id.
    id: String,
    /// Include the revision chain.
    #[arg(long)]
    revisions: bool,
    /// Include links and audit events.
    #[arg(long)]
    events: bool,
}

#[derive(Args)]
struct ConsolidateArgs {
    /// Restrict to one scope.
    #[arg(long)]
    scope: Option<String>,
    /// Compute clusters without writing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct LoopArgs {
    /// The question to answer.
    question: String,
    /// LLM command (e.g. "claude -p").
    #[arg(long)]
    llm: Option<String>,
    /// Protocol: json|regex|passive.
    #[arg(long, default_value = "json")]
    protocol: String,
    /// Prompt delivery mode: stdin|file.
    #[arg(long, default_value = "stdin")]
    llm_mode: String,
    /// Maximum LLM invocations.
    #[arg(long)]
    max_calls: Option<u32>,
    /// Context token budget ($MEMCTL_BUDGET).
    #[arg(long, env = "MEMCTL_BUDGET")]
    budget: Option<usize>,
    /// Restrict recall to one mount (id, path, or name).
    #[arg(long)]
    mount: Option<String>,
    /// Write the JSONL trace to this file.
    #[arg(long)]
    trace: Option<PathBuf>,
    /// Replay a previously recorded trace instead of invoking the LLM.
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Fail on malformed JSON protocol lines.
    #[arg(long)]
    strict: bool,
    /// Per-call LLM timeout in seconds.
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

#[derive(Args)]
struct MountArgs {
    /// Folder to register (omit with --list or --remove).
    path: Option<PathBuf>,
    /// Display name for the mount.
    #[arg(long)]
    name: Option<String>,
    /// Glob patterns excluded from sync.
    #[arg(long, value_delimiter = ',')]
    ignore: Vec<String>,
    /// List registered mounts.
    #[arg(long)]
    list: bool,
    /// Remove a mount by id, path, or name.
    #[arg(long)]
    remove: Option<String>,
}

#[derive(Args)]
struct SyncArgs {
    /// Folder to sync; all registered mounts when omitted.
    path: Option<PathBuf>,
    /// Re-process every file, ignoring stored hashes.
    #[arg(long)]
    full: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Folder to inspect (auto-mounted); whole store when omitted.
    path: Option<PathBuf>,
    /// Token budget for the structural block ($MEMCTL_BUDGET).
    #[arg(long, env = "MEMCTL_BUDGET")]
    budget: Option<usize>,
    /// Sync policy: auto|always|never.
    #[arg(long, default_value = "auto")]
    sync: String,
    /// Remove the auto-mount after inspecting.
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Args)]
struct AskArgs {
    /// Folder to ask about.
    path: PathBuf,
    /// The question.
    question: String,
    /// LLM command (e.g. "claude -p").
    #[arg(long)]
    llm: Option<String>,
    /// Total token budget ($MEMCTL_BUDGET).
    #[arg(long, env = "MEMCTL_BUDGET")]
    budget: Option<usize>,
    /// Tokens reserved for the structural block.
    #[arg(long, default_value_t = 600)]
    inspect_cap: usize,
    /// Sync policy: auto|always|never.
    #[arg(long, default_value = "auto")]
    sync: String,
    /// Remove the auto-mount afterwards.
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Args)]
struct ChatArgs {
    /// Question for a single turn (reads stdin when omitted).
    question: Option<String>,
    /// LLM command.
    #[arg(long)]
    llm: Option<String>,
    /// Restrict recall to one mount.
    #[arg(long)]
    mount: Option<String>,
    /// Persist answers as STM items (through policy).
    #[arg(long)]
    persist: bool,
    /// Session id recorded in provenance ($MEMCTL_SESSION).
    #[arg(long, env = "MEMCTL_SESSION")]
    session: Option<String>,
    /// Context token budget ($MEMCTL_BUDGET).
    #[arg(long, env = "MEMCTL_BUDGET")]
    budget: Option<usize>,
}

#[derive(Args)]
struct ExportArgs {
    /// Filter by tier.
    #[arg(long)]
    tier: Option<String>,
    /// Filter by item type.
    #[arg(long = "type")]
    type_filter: Option<String>,
    /// Filter by scope.
    #[arg(long)]
    scope: Option<String>,
    /// Include archived items.
    #[arg(long)]
    include_archived: bool,
}

#[derive(Args)]
struct ImportArgs {
    /// JSONL file ("-" or omitted reads stdin).
    file: Option<PathBuf>,
    /// Keep source item ids instead of minting new ones.
    #[arg(long)]
    preserve_ids: bool,
    /// Count without writing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ServeArgs {
    /// Constrain database paths to this directory tree.
    #[arg(long)]
    db_root: Option<PathBuf>,
    /// Per-call write size cap in bytes.
    #[arg(long, default_value_t = 65_536)]
    max_write_bytes: usize,
    /// Disable rate limiting.
    #[arg(long)]
    no_rate_limit: bool,
    /// Write operations cap per minute.
    #[arg(long, default_value_t = 20)]
    writes_per_minute: u32,
    /// Read operations cap per minute.
    #[arg(long, default_value_t = 120)]
    reads_per_minute: u32,
    /// Audit log file (default: stderr).
    #[arg(long)]
    audit_log: Option<PathBuf>,
    /// Default LLM command for ask/loop tools.
    #[arg(long)]
    llm: Option<String>,
}

#[derive(Args)]
struct ReindexArgs {
    /// Tokenizer preset (fr|en|raw) or custom string ($MEMCTL_FTS).
    #[arg(long, env = "MEMCTL_FTS")]
    tokenizer: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    // stdout carries data; all diagnostics go to stderr.
    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = cli::CliContext::new(cli.db.as_deref(), cli.config.as_deref(), cli.json, cli.quiet);

    let result = match cli.command {
        Command::Init => cli::init::run(&ctx),
        Command::Push(args) => cli::push::run(
            &ctx,
            &args.sources,
            &args.scope,
            &args.tags,
            args.full,
            args.no_inject,
        ),
        Command::Pull(args) => {
            cli::pull::run(&ctx, args.title.as_deref(), &args.scope, &args.tags)
        }
        Command::Search(args) => cli::search::run(
            &ctx,
            &args.query,
            args.tier.as_deref(),
            args.type_filter.as_deref(),
            args.scope.as_deref(),
            args.limit,
        ),
        Command::Show(args) => cli::show::run(&ctx, &args.id, args.revisions, args.events),
        Command::Stats => cli::stats::run(&ctx),
        Command::Consolidate(args) => {
            cli::consolidate::run(&ctx, args.scope.as_deref(), args.dry_run)
        }
        Command::Loop(args) => cli::loop_cmd::run(
            &ctx,
            cli::loop_cmd::LoopCmdArgs {
                question: args.question,
                llm: args.llm,
                protocol: args.protocol,
                llm_mode: args.llm_mode,
                max_calls: args.max_calls,
                budget: args.budget,
                mount: args.mount,
                trace: args.trace,
                replay: args.replay,
                strict: args.strict,
                timeout: args.timeout,
            },
        ),
        Command::Mount(args) => cli::mount_cmd::run(
            &ctx,
            args.path.as_deref(),
            args.name.as_deref(),
            &args.ignore,
            args.list,
            args.remove.as_deref(),
        ),
        Command::Sync(args) => cli::sync_cmd::run(&ctx, args.path.as_deref(), args.full),
        Command::Inspect(args) => cli::inspect_cmd::run(
            &ctx,
            args.path.as_deref(),
            args.budget,
            &args.sync,
            args.ephemeral,
        ),
        Command::Ask(args) => cli::ask_cmd::run(
            &ctx,
            &args.path,
            &args.question,
            args.llm.as_deref(),
            args.budget,
            args.inspect_cap,
            &args.sync,
            args.ephemeral,
        ),
        Command::Chat(args) => cli::chat_cmd::run(
            &ctx,
            args.question.as_deref(),
            args.llm.as_deref(),
            args.mount.as_deref(),
            args.persist,
            args.session.as_deref(),
            args.budget,
        ),
        Command::Export(args) => cli::export::run(
            &ctx,
            args.tier.as_deref(),
            args.type_filter.as_deref(),
            args.scope.as_deref(),
            args.include_archived,
        ),
        Command::Import(args) => {
            cli::import::run(&ctx, args.file.as_deref(), args.preserve_ids, args.dry_run)
        }
        Command::Serve(args) => cli::serve::run(
            &ctx,
            args.db_root,
            args.max_write_bytes,
            !args.no_rate_limit,
            args.writes_per_minute,
            args.reads_per_minute,
            args.audit_log,
            args.llm,
        ),
        Command::Reindex(args) => cli::reindex::run(&ctx, args.tokenizer.as_deref()),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<MemctlError>() {
        Some(err) => err.exit_code(),
        None => 2,
    }
}
