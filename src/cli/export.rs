use super::{CliContext, CmdResult};
use memctl::error::MemctlError;
use memctl::export_import::export_items;
use memctl::memory::store::ItemFilter;
use memctl::memory::types::MemoryType;

/// JSONL export to stdout; progress to stderr.
pub fn run(
    ctx: &CliContext,
    tier: Option<&str>,
    type_filter: Option<&str>,
    scope: Option<&str>,
    include_archived: bool,
) -> CmdResult {
    let store = ctx.open_store()?;
    let filter = ItemFilter {
        tier: tier
            .map(|t| t.parse().map_err(MemctlError::Validation))
            .transpose()?,
        type_filter: type_filter.map(MemoryType::from),
        scope: scope.map(str::to_string),
        include_archived,
    };

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    let count = export_items(&store, &filter, &mut handle)?;
    ctx.progress(&format!("[export] {count} item(s) exported"));
    Ok(0)
}
