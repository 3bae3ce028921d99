use serde::Serialize;

use super::{CliContext, CmdResult};
use memctl::error::MemctlError;
use memctl::memory::store::ItemFilter;
use memctl::memory::types::{MemoryType, SearchMeta};

#[derive(Serialize)]
struct SearchOutput<'a> {
    items: Vec<serde_json::Value>,
    meta: &'a SearchMeta,
}

/// Search through the FTS cascade; prints results and the strategy used.
pub fn run(
    ctx: &CliContext,
    query: &str,
    tier: Option<&str>,
    type_filter: Option<&str>,
    scope: Option<&str>,
    limit: usize,
) -> CmdResult {
    let mut store = ctx.open_store()?;
    let filter = ItemFilter {
        tier: tier
            .map(|t| t.parse().map_err(MemctlError::Validation))
            .transpose()?,
        type_filter: type_filter.map(MemoryType::from),
        scope: scope.map(str::to_string),
        include_archived: false,
    };

    let (items, meta) = store.search_fulltext(query, &filter, limit)?;
    ctx.progress(&format!(
        "[search] strategy={} candidates={}{}",
        meta.strategy.as_str(),
        meta.total_candidates,
        meta.dropped_terms
            .is_empty()
            .then(String::new)
            .unwrap_or_else(|| format!(" dropped={:?}", meta.dropped_terms))
    ));
    if let Some(ref hint) = meta.morphological_hint {
        ctx.progress(&format!("[search] hint: {hint}"));
    }

    let rows: Vec<serde_json::Value> = items
        .iter()
        .map(|it| {
            serde_json::json!({
                "id": it.id,
                "tier": it.tier.as_str(),
                "type": it.item_type.as_str(),
                "title": it.title,
                "tags": it.tags,
                "quarantined": !it.injectable,
                "content_preview": it.content.chars().take(160).collect::<String>(),
            })
        })
        .collect();

    let output = SearchOutput {
        items: rows,
        meta: &meta,
    };
    ctx.emit(&output, || {
        items
            .iter()
            .map(|it| {
                format!(
                    "{}  [{}:{}]  {}{}",
                    it.id,
                    it.tier.as_str(),
                    it.item_type.as_str(),
                    it.title,
                    if it.injectable { "" } else { "  (quarantined)" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(0)
}
