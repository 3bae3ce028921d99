use super::{CliContext, CmdResult};
use memctl::ingest::{ingest_file, ingest_reader, resolve_sources, IngestOptions, IngestResult};

/// Ingest files, directories, or globs; `-` reads stdin.
pub fn run(
    ctx: &CliContext,
    sources: &[String],
    scope: &str,
    tags: &[String],
    full: bool,
    no_inject: bool,
) -> CmdResult {
    let mut store = ctx.open_store()?;
    let policy = ctx.policy();
    let extractors = ctx.extractors();

    let opts = IngestOptions {
        scope: scope.to_string(),
        extra_tags: tags.to_vec(),
        injectable: !no_inject,
        full,
        ..Default::default()
    };

    let mut total = IngestResult::default();

    if sources.len() == 1 && sources[0] == "-" {
        let mut stdin = std::io::stdin().lock();
        let result = ingest_reader(&mut store, &policy, &mut stdin, None, &opts)?;
        accumulate(&mut total, result);
    } else {
        let files = resolve_sources(sources)?;
        if files.is_empty() {
            ctx.progress("[push] no ingestable files found");
            return Ok(1);
        }
        for file in &files {
            let result = ingest_file(&mut store, &policy, &extractors, file, &opts)?;
            accumulate(&mut total, result);
        }
    }

    ctx.progress(&format!(
        "[push] {} file(s) processed, {} skipped, {} chunk(s) created, {} rejected",
        total.files_processed, total.files_skipped, total.chunks_created, total.chunks_rejected
    ));
    ctx.emit(&total, || {
        total
            .item_ids
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(0)
}

fn accumulate(total: &mut IngestResult, part: IngestResult) {
    total.files_processed += part.files_processed;
    total.files_skipped += part.files_skipped;
    total.chunks_created += part.chunks_created;
    total.chunks_quarantined += part.chunks_quarantined;
    total.chunks_rejected += part.chunks_rejected;
    total.item_ids.extend(part.item_ids);
}
