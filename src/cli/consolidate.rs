use super::{CliContext, CmdResult};
use memctl::memory::consolidate::consolidate;

/// Deterministic consolidation pass.
pub fn run(ctx: &CliContext, scope: Option<&str>, dry_run: bool) -> CmdResult {
    let mut store = ctx.open_store()?;
    let report = consolidate(&mut store, &ctx.config.consolidate, scope, dry_run)?;

    ctx.progress(&format!(
        "[consolidate]{} {} processed, {} cluster(s), {} merged, {} promoted",
        if dry_run { " (dry run)" } else { "" },
        report.items_processed,
        report.clusters_found,
        report.items_merged,
        report.items_promoted
    ));
    ctx.emit(&report, || {
        report
            .merge_chains
            .iter()
            .map(|chain| {
                format!(
                    "{} <- {}",
                    chain.survivor_id.as_deref().unwrap_or("(dry run)"),
                    chain.source_ids.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(0)
}
