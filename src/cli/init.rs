use super::{CliContext, CmdResult};

/// Create (or open) the database, printing its resolved path.
pub fn run(ctx: &CliContext) -> CmdResult {
    let store = ctx.open_store()?;
    ctx.progress(&format!(
        "[init] store ready (fts5={}, tokenizer={})",
        store.fts_enabled(),
        store.tokenizer()
    ));
    println!("{}", ctx.db_path.display());
    Ok(0)
}
