//! Memory injection formatting — the stable `format_version=1` contract.
//!
//! Single source of truth for the injection block; every tool and
//! orchestrator delegates here. Breaking changes to the output must
//! increment [`FORMAT_VERSION`]; additive fields do not.

use crate::memory::types::MemoryItem;

pub const FORMAT_VERSION: u32 = 1;

/// Render scored items (best first) into the injection block.
///
/// The budget is enforced by prefix trimming at item granularity: an item
/// is either fully included or not at all, never cut mid-sentence.
pub fn format_injection_block(
    items: &[MemoryItem],
    budget_tokens: usize,
    total_matched: usize,
    injection_type: &str,
) -> String {
    if items.is_empty() {
        return String::new();
    }

    let char_budget = budget_tokens * 4;
    let mut included: Vec<String> = Vec::new();
    let mut total_chars = 0usize;

    for (rank, item) in items.iter().enumerate() {
        let entry = format_single_item(rank + 1, item);
        let entry_chars = entry.chars().count();
        if total_chars + entry_chars > char_budget && !included.is_empty() {
            break;
        }
        total_chars += entry_chars;
        included.push(entry);
    }

    let tokens_used = total_chars / 4;
    let mut lines = vec![
        "## Memory (Injected)".to_string(),
        format!("format_version: {FORMAT_VERSION}"),
        format!("injection_type: {injection_type}"),
        format!("budget_tokens: {budget_tokens}"),
        format!("matched: {total_matched}"),
        format!("used: {tokens_used}"),
        String::new(),
    ];
    let included_count = included.len();
    lines.extend(included);
    lines.push(format!(
        "--- End Memory (format_version={FORMAT_VERSION}, {included_count} items, {tokens_used} tokens) ---"
    ));

    lines.join("\n")
}

fn format_single_item(rank: usize, item: &MemoryItem) -> String {
    let tier = item.tier.as_str().to_uppercase();
    let tags = if item.tags.is_empty() {
        "none".to_string()
    } else {
        item.tags.join(", ")
    };
    let prov = if item.provenance.source_id.is_empty() {
        item.provenance.source_kind.as_str().to_string()
    } else {
        format!(
            "{}:{}",
            item.provenance.source_kind.as_str(),
            item.provenance.source_id
        )
    };

    let mut lines = vec![format!(
        "[{rank}] [{tier}] {} — {}",
        item.item_type.as_str(),
        item.title
    )];
    for content_line in item.content.trim().lines() {
        lines.push(format!("    {content_line}"));
    }
    lines.push(format!("    id: {}", item.id));
    lines.push(format!("    tags: {tags}"));
    lines.push(format!("    provenance: {prov}"));
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryTier;

    fn item(title: &str, content: &str) -> MemoryItem {
        let mut it = MemoryItem::new(title, content);
        it.tags = vec!["alpha".into(), "beta".into()];
        it.provenance.source_id = "doc.md".into();
        it
    }

    #[test]
    fn block_carries_header_and_entries() {
        let items = vec![item("First", "the content"), item("Second", "more content")];
        let block = format_injection_block(&items, 1500, 2, "memory_recall");

        assert!(block.starts_with("## Memory (Injected)"));
        assert!(block.contains("format_version: 1"));
        assert!(block.contains("budget_tokens: 1500"));
        assert!(block.contains("matched: 2"));
        assert!(block.contains("[1] [STM] note — First"));
        assert!(block.contains("[2] [STM] note — Second"));
        assert!(block.contains(&format!("id: {}", items[0].id)));
        assert!(block.contains("tags: alpha, beta"));
        assert!(block.contains("--- End Memory (format_version=1, 2 items"));
    }

    #[test]
    fn empty_items_empty_block() {
        assert_eq!(format_injection_block(&[], 1500, 0, "memory_recall"), "");
    }

    #[test]
    fn budget_trims_whole_items_only() {
        let items: Vec<MemoryItem> = (0..20)
            .map(|i| item(&format!("Item {i}"), &"word ".repeat(100)))
            .collect();
        // Each entry is ~530 chars ≈ 130 tokens; budget of 300 fits ~2
        let block = format_injection_block(&items, 300, 20, "memory_recall");
        let entry_count = block.matches("\n[").count();
        assert!(entry_count < 20);
        assert!(entry_count >= 1);
        // No partially-included content: every included header has its id line
        assert_eq!(block.matches("    id: ").count(), entry_count);
    }

    #[test]
    fn tier_tag_reflects_item() {
        let mut it = item("Promoted", "stable knowledge");
        it.tier = MemoryTier::Ltm;
        let block = format_injection_block(&[it], 1500, 1, "memory_recall");
        assert!(block.contains("[1] [LTM]"));
    }
}
