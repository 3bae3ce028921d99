use std::io::BufRead;
use std::path::Path;

use super::{CliContext, CmdResult};
use memctl::export_import::import_items;

/// JSONL import from a file or stdin, through the policy engine.
pub fn run(ctx: &CliContext, file: Option<&Path>, preserve_ids: bool, dry_run: bool) -> CmdResult {
    let mut store = ctx.open_store()?;
    let policy = ctx.policy();
    let quiet = ctx.quiet;
    let mut log = |msg: &str| {
        if !quiet {
            eprintln!("{msg}");
        }
    };

    let result = match file {
        Some(path) if path.as_os_str() != "-" => {
            let file = std::fs::File::open(path)?;
            let mut reader = std::io::BufReader::new(file);
            import_items(&mut store, &policy, &mut reader, preserve_ids, dry_run, &mut log)?
        }
        _ => {
            let stdin = std::io::stdin();
            let mut locked = stdin.lock();
            let reader: &mut dyn BufRead = &mut locked;
            import_items(&mut store, &policy, reader, preserve_ids, dry_run, &mut log)?
        }
    };

    ctx.emit(&result, || {
        format!(
            "{} imported, {} dedup, {} policy, {} error(s)",
            result.imported, result.skipped_dedup, result.skipped_policy, result.errors
        )
    });

    Ok(if result.is_failure() { 1 } else { 0 })
}
