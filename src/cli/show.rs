use super::{CliContext, CmdResult};
use memctl::error::MemctlError;

/// Show one item, optionally with revisions and audit events.
pub fn run(ctx: &CliContext, id: &str, revisions: bool, events: bool) -> CmdResult {
    let mut store = ctx.open_store()?;
    let item = store
        .read_item(id, false)?
        .ok_or_else(|| MemctlError::NotFound(id.to_string()))?;

    let mut output = serde_json::to_value(&item)?;
    output["content_hash"] = item.content_hash().into();

    if revisions {
        let chain: Vec<serde_json::Value> = store
            .read_revisions(id)?
            .into_iter()
            .map(|(num, snapshot, changed_at, reason)| {
                serde_json::json!({
                    "revision_num": num,
                    "changed_at": changed_at,
                    "reason": reason,
                    "snapshot": serde_json::from_str::<serde_json::Value>(&snapshot)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect();
        output["revisions"] = chain.into();
    }

    if events {
        output["links"] = serde_json::to_value(store.read_links(id)?)?;
        output["events"] = serde_json::to_value(store.read_events(Some(id), None, 50)?)?;
    }

    ctx.emit(&output, || {
        let mut text = format!(
            "{}\ntier: {}  type: {}  scope: {}\ntags: {}\ninjectable: {}  archived: {}\n\n{}",
            item.title,
            item.tier.as_str(),
            item.item_type.as_str(),
            item.scope,
            item.tags.join(", "),
            item.injectable,
            item.archived,
            item.content
        );
        if revisions {
            text.push_str(&format!(
                "\n\n{} revision(s)",
                output["revisions"].as_array().map(Vec::len).unwrap_or(0)
            ));
        }
        text
    });
    Ok(0)
}
