use super::{CliContext, CmdResult};
use memctl::config::resolve_tokenizer;

/// Rebuild the FTS index, optionally switching tokenizer.
pub fn run(ctx: &CliContext, tokenizer: Option<&str>) -> CmdResult {
    let mut store = ctx.open_store()?;
    let resolved = tokenizer.map(resolve_tokenizer);

    let (count, elapsed) = store.rebuild_fts(resolved.as_deref())?;
    ctx.progress(&format!(
        "[reindex] {count} item(s) indexed in {:.1}ms (tokenizer: {})",
        elapsed.as_secs_f64() * 1000.0,
        store.tokenizer()
    ));
    ctx.emit(
        &serde_json::json!({
            "items_indexed": count,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
            "tokenizer": store.tokenizer(),
        }),
        || count.to_string(),
    );
    Ok(0)
}
