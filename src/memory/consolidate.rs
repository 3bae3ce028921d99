//! Deterministic consolidation: STM → MTM → LTM promotion.
//!
//! Clusters non-archived STM items by (type, tag-set Jaccard) with
//! single-linkage, merges each cluster (longest content wins, ties broken by
//! earliest `created_at` then lexicographic id), archives the originals with
//! `supersedes` links pointing at the survivor, and promotes MTM items to
//! LTM by usage count or type. No LLM calls, no network — same input always
//! yields the same output.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::config::ConsolidateConfig;
use crate::error::Result;
use crate::memory::store::{ItemFilter, MemoryStore};
use crate::memory::types::{
    EventAction, LinkRel, MemoryItem, MemoryLink, MemoryTier, MemoryType, Provenance, SourceKind,
};

/// Summary of one consolidation run.
#[derive(Debug, Serialize, Default)]
pub struct ConsolidateReport {
    pub items_processed: usize,
    pub clusters_found: usize,
    pub items_merged: usize,
    pub items_promoted: usize,
    pub merge_chains: Vec<MergeChain>,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct MergeChain {
    pub survivor_id: Option<String>,
    pub source_ids: Vec<String>,
    pub source_titles: Vec<String>,
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root index wins, keeping cluster identity stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Single-linkage clustering within each type bucket: any pair with
/// tag-Jaccard at or above the threshold joins the same cluster. Clusters
/// of size 1 are dropped.
fn cluster_items(items: &[MemoryItem], similarity_threshold: f64) -> Vec<Vec<usize>> {
    let mut by_type: BTreeMap<MemoryType, Vec<usize>> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        by_type
            .entry(item.item_type)
            .or_default()
            .push(i);
    }

    let tag_sets: Vec<HashSet<String>> = items
        .iter()
        .map(|it| it.normalized_tags().into_iter().collect())
        .collect();

    let mut uf = UnionFind::new(items.len());
    for bucket in by_type.values() {
        for (a_pos, &a) in bucket.iter().enumerate() {
            for &b in &bucket[a_pos + 1..] {
                if jaccard(&tag_sets[a], &tag_sets[b]) >= similarity_threshold {
                    uf.union(a, b);
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..items.len() {
        clusters.entry(uf.find(i)).or_default().push(i);
    }
    clusters.into_values().filter(|c| c.len() >= 2).collect()
}

/// Pick the merge survivor and build the merged item.
///
/// Winner: longest content; ties by earliest `created_at`, then
/// lexicographic id. Tags are unioned, usage counts summed. The survivor is
/// minted fresh at MTM with tool provenance naming the merged-away ids.
fn deterministic_merge(cluster: &[&MemoryItem]) -> MemoryItem {
    let mut ordered: Vec<&&MemoryItem> = cluster.iter().collect();
    ordered.sort_by(|a, b| {
        b.content
            .chars()
            .count()
            .cmp(&a.content.chars().count())
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    let winner = ordered[0];

    let mut tags: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut total_usage = 0u64;
    for item in cluster {
        for tag in item.normalized_tags() {
            if seen.insert(tag.clone()) {
                tags.push(tag);
            }
        }
        total_usage += item.usage_count;
    }

    let mut merged = MemoryItem::new(winner.title.clone(), winner.content.clone());
    merged.tier = MemoryTier::Mtm;
    merged.item_type = winner.item_type;
    merged.tags = tags;
    merged.scope = winner.scope.clone();
    merged.usage_count = total_usage;
    merged.injectable = winner.injectable;
    merged.provenance = Provenance {
        source_kind: SourceKind::Tool,
        source_id: "memctl-consolidate".into(),
        justification: format!(
            "merged {} items: {}",
            cluster.len(),
            cluster
                .iter()
                .map(|it| it.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        session_id: None,
    };
    merged
}

/// Run the consolidation pipeline over one scope (or all scopes).
pub fn consolidate(
    store: &mut MemoryStore,
    config: &ConsolidateConfig,
    scope: Option<&str>,
    dry_run: bool,
) -> Result<ConsolidateReport> {
    let mut report = ConsolidateReport {
        dry_run,
        ..Default::default()
    };

    let filter = ItemFilter {
        tier: Some(MemoryTier::Stm),
        scope: scope.map(str::to_string),
        ..Default::default()
    };
    let items = store.list_items(&filter, 5000)?;
    report.items_processed = items.len();

    let clusters = if items.len() >= 2 {
        cluster_items(&items, config.cluster_similarity_threshold)
    } else {
        Vec::new()
    };
    report.clusters_found = clusters.len();

    if dry_run {
        for cluster in &clusters {
            report.merge_chains.push(MergeChain {
                survivor_id: None,
                source_ids: cluster.iter().map(|&i| items[i].id.clone()).collect(),
                source_titles: cluster.iter().map(|&i| items[i].title.clone()).collect(),
            });
        }
        return Ok(report);
    }

    for cluster in &clusters {
        let members: Vec<&MemoryItem> = cluster.iter().map(|&i| &items[i]).collect();
        let mut merged = deterministic_merge(&members);

        // Archive originals first so the survivor's content hash does not
        // collide with the winner it copies from.
        for original in &members {
            store.supersede_item(&original.id, &merged.id)?;
        }
        store.write_item(&mut merged, "consolidate")?;

        for original in &members {
            store.write_link(&MemoryLink::new(
                original.id.clone(),
                merged.id.clone(),
                LinkRel::Supersedes,
            ))?;
        }

        report.items_merged += members.len();
        report.merge_chains.push(MergeChain {
            survivor_id: Some(merged.id.clone()),
            source_ids: members.iter().map(|it| it.id.clone()).collect(),
            source_titles: members.iter().map(|it| it.title.clone()).collect(),
        });

        store.log_event(
            EventAction::Consolidate,
            Some(&merged.id),
            serde_json::json!({
                "sources": members.iter().map(|it| it.id.as_str()).collect::<Vec<_>>(),
            }),
            &merged.content_hash(),
        )?;
    }

    // Promotion pass: MTM → LTM by usage or by type.
    let mtm_filter = ItemFilter {
        tier: Some(MemoryTier::Mtm),
        scope: scope.map(str::to_string),
        ..Default::default()
    };
    for item in store.list_items(&mtm_filter, 5000)? {
        let by_usage = item.usage_count >= config.usage_count_for_ltm;
        let by_type = config
            .auto_promote_types
            .iter()
            .any(|t| t == item.item_type.as_str());
        if by_usage || by_type {
            store.update_item(&item.id, |it| it.tier = MemoryTier::Ltm)?;
            report.items_promoted += 1;
        }
    }

    tracing::info!(
        clusters = report.clusters_found,
        merged = report.items_merged,
        promoted = report.items_promoted,
        "consolidation complete"
    );
    Ok(report)
}
