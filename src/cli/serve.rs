use std::path::PathBuf;

use super::{CliContext, CmdResult};
use memctl::server::{serve_stdio, ServeOptions};

/// Start the MCP server on stdio. Blocks until the client disconnects.
#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &CliContext,
    db_root: Option<PathBuf>,
    max_write_bytes: usize,
    rate_limit: bool,
    writes_per_minute: u32,
    reads_per_minute: u32,
    audit_log: Option<PathBuf>,
    llm: Option<String>,
) -> CmdResult {
    let opts = ServeOptions {
        db_path: ctx.db_path.clone(),
        db_root,
        max_write_bytes,
        rate_limit,
        writes_per_minute,
        reads_per_minute,
        audit_log,
        llm_cmd: llm,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_stdio(ctx.config.clone(), opts))?;
    Ok(0)
}
