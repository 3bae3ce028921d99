use super::{CliContext, CmdResult};

/// Store statistics.
pub fn run(ctx: &CliContext) -> CmdResult {
    let store = ctx.open_store()?;
    let stats = store.stats()?;

    ctx.emit(&stats, || {
        let mut lines = vec![
            format!("items:   {}", stats.total_items),
            format!("events:  {}", stats.events_count),
            format!("mounts:  {}", stats.mounts_count),
            format!("corpus:  {} file(s)", stats.corpus_files),
        ];
        for (tier, count) in &stats.by_tier {
            lines.push(format!("  {tier}: {count}"));
        }
        lines.push(format!(
            "fts5:    {} (tokenizer: {})",
            stats.fts5_available,
            stats.fts_tokenizer.as_deref().unwrap_or("-")
        ));
        if stats.fts_tokenizer_mismatch {
            lines.push("warning: stored tokenizer differs — run `memctl reindex`".into());
        }
        lines.join("\n")
    });
    Ok(0)
}
