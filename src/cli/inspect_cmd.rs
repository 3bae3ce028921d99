use std::path::Path;

use super::{CliContext, CmdResult};
use memctl::config::resolve_budget;
use memctl::inspect::{format_inspect_block, inspect_path, inspect_stats, SyncMode};

/// Structural inspection: a folder (auto-mounted, staleness-synced) or the
/// whole store. The injection block goes to stdout.
pub fn run(
    ctx: &CliContext,
    path: Option<&Path>,
    budget: Option<usize>,
    sync: &str,
    ephemeral: bool,
) -> CmdResult {
    let mut store = ctx.open_store()?;
    let budget = resolve_budget(budget);
    let sync_mode: SyncMode = sync.parse()?;

    match path {
        Some(path) => {
            let policy = ctx.policy();
            let extractors = ctx.extractors();
            let quiet = ctx.quiet;
            let outcome = inspect_path(
                &mut store,
                &policy,
                &extractors,
                path,
                sync_mode,
                &ctx.config.inspect,
                memctl::ingest::DEFAULT_MAX_CHUNK_CHARS,
                &mut |msg| {
                    if !quiet {
                        eprintln!("{msg}");
                    }
                },
            )?;
            let block = format_inspect_block(&outcome.stats, Some(&outcome.mount_label), budget);

            if ephemeral {
                store.remove_mount(&outcome.mount_id)?;
                ctx.progress("[inspect] ephemeral: mount removed");
            }

            ctx.emit(&outcome, || block);
        }
        None => {
            let stats = inspect_stats(&store, None, &ctx.config.inspect)?;
            let block = format_inspect_block(&stats, None, budget);
            ctx.emit(&stats, || block);
        }
    }
    Ok(0)
}
