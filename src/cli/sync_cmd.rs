use std::path::Path;

use super::{CliContext, CmdResult};
use memctl::sync::{sync_all, sync_mount};

/// Sync one folder or every registered mount.
pub fn run(ctx: &CliContext, path: Option<&Path>, full: bool) -> CmdResult {
    let mut store = ctx.open_store()?;
    let policy = ctx.policy();
    let extractors = ctx.extractors();
    let max_chunk = memctl::ingest::DEFAULT_MAX_CHUNK_CHARS;

    let results = match path {
        Some(p) => vec![sync_mount(
            &mut store,
            &policy,
            &extractors,
            p,
            !full,
            None,
            max_chunk,
        )?],
        None => sync_all(&mut store, &policy, &extractors, !full, max_chunk)?,
    };

    for result in &results {
        ctx.progress(&format!(
            "[sync] {}: {} new, {} changed, {} unchanged, {} orphaned, {} chunk(s)",
            result.mount_path,
            result.files_new,
            result.files_changed,
            result.files_unchanged,
            result.files_orphaned,
            result.chunks_created
        ));
    }
    ctx.emit(&results, || {
        format!(
            "{} mount(s) synced, {} chunk(s) created",
            results.len(),
            results.iter().map(|r| r.chunks_created).sum::<usize>()
        )
    });
    Ok(0)
}
