//! Full-text recall: the deterministic strategy cascade.
//!
//! The ladder is strict: AND → REDUCED_AND → PREFIX_AND → OR_FALLBACK →
//! LIKE. The first rung that returns any result wins, and [`SearchMeta`]
//! records which one. PREFIX_AND is skipped when the active tokenizer stems
//! (a stemmer makes prefix expansion redundant). OR results are re-ranked by
//! coverage — the number of distinct query terms present — with the stable
//! sort preserving BM25 order on ties.

use rusqlite::params;

use crate::error::Result;
use crate::memory::store::{row_to_item, ItemFilter, MemoryStore};
use crate::memory::types::{EventAction, MemoryItem, SearchMeta, SearchStrategy};
use crate::query::{drop_order, normalize_query};

/// Minimum term length for prefix expansion.
const PREFIX_MIN_LEN: usize = 5;

impl MemoryStore {
    /// Full-text search with the FTS5 cascade and LIKE fallback.
    ///
    /// The query is normalized (stop words stripped, identifiers preserved)
    /// before entering the ladder. Returns the matched items and metadata
    /// about how the query was resolved; the same metadata is retained on
    /// the store for callers that use the single-return variant.
    pub fn search_fulltext(
        &mut self,
        query: &str,
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<(Vec<MemoryItem>, SearchMeta)> {
        let normalized = normalize_query(query);
        let terms: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();

        if terms.is_empty() {
            let meta = SearchMeta::empty();
            self.last_search_meta = Some(meta.clone());
            let items = self.list_items(filter, limit)?;
            return Ok((items, meta));
        }

        let outcome = if self.fts_enabled {
            match self.run_cascade(&terms, filter, limit) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(error = %e, "FTS cascade failed, falling back to LIKE");
                    None
                }
            }
        } else {
            None
        };

        let (items, mut meta) = match outcome {
            Some(v) => v,
            None => {
                let items = self.search_like(&terms, filter, limit)?;
                let meta = SearchMeta {
                    strategy: SearchStrategy::Like,
                    original_terms: terms.clone(),
                    effective_terms: terms.clone(),
                    dropped_terms: Vec::new(),
                    total_candidates: items.len(),
                    top_rank: None,
                    morphological_hint: None,
                };
                (items, meta)
            }
        };

        // Inflection hint: weak strategies on a non-stemming tokenizer with
        // multi-term queries usually mean morphology misses.
        if matches!(
            meta.strategy,
            SearchStrategy::PrefixAnd | SearchStrategy::OrFallback | SearchStrategy::Like
        ) && terms.len() > 1
            && !self.is_stemming_tokenizer()
        {
            meta.morphological_hint = Some(
                "some query terms may not match due to inflection; \
                 consider: memctl reindex --tokenizer en"
                    .into(),
            );
        }

        self.last_search_meta = Some(meta.clone());
        self.log_event(
            EventAction::Search,
            None,
            serde_json::json!({
                "query": query,
                "strategy": meta.strategy.as_str(),
                "candidates": meta.total_candidates,
            }),
            "",
        )?;

        Ok((items, meta))
    }

    /// Scoped injectable recall for loop/ask: post-filters to injectable
    /// items, and (when a mount is given) to items produced by that mount's
    /// corpus files. Post-filtering is used because FTS MATCH does not
    /// compose with joins portably.
    pub fn recall_injectable(
        &mut self,
        query: &str,
        mount_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let allowed: Option<std::collections::HashSet<String>> = match mount_id {
            Some(mid) => {
                let mut ids = std::collections::HashSet::new();
                for file in self.list_corpus_files(Some(mid))? {
                    ids.extend(file.item_ids);
                }
                Some(ids)
            }
            None => None,
        };

        let (items, _meta) = self.search_fulltext(query, &ItemFilter::default(), limit)?;
        Ok(items
            .into_iter()
            .filter(|item| item.injectable)
            .filter(|item| match &allowed {
                Some(ids) => ids.contains(&item.id),
                None => true,
            })
            .collect())
    }

    fn run_cascade(
        &self,
        terms: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<(Vec<MemoryItem>, SearchMeta)> {
        // Rung 1: AND over all terms.
        let hits = self.search_fts5_and(terms, filter, limit)?;
        if !hits.is_empty() {
            return Ok(finish(hits, SearchStrategy::And, terms, terms.to_vec(), vec![]));
        }

        // Rung 2: REDUCED_AND — drop the shortest term and retry until one
        // term remains.
        if terms.len() > 1 {
            let order = drop_order(terms);
            let mut dropped: Vec<String> = Vec::new();
            for &idx in &order[..order.len() - 1] {
                dropped.push(terms[idx].clone());
                let remaining: Vec<String> = terms
                    .iter()
                    .filter(|t| !dropped.contains(t))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    break;
                }
                let hits = self.search_fts5_and(&remaining, filter, limit)?;
                if !hits.is_empty() {
                    return Ok(finish(
                        hits,
                        SearchStrategy::ReducedAnd,
                        terms,
                        remaining,
                        dropped,
                    ));
                }
            }
        }

        // Rung 3: PREFIX_AND — redundant under a stemming tokenizer.
        if !self.is_stemming_tokenizer() {
            let hits = self.search_fts5_prefix_and(terms, filter, limit)?;
            if !hits.is_empty() {
                return Ok(finish(
                    hits,
                    SearchStrategy::PrefixAnd,
                    terms,
                    terms.to_vec(),
                    vec![],
                ));
            }
        }

        // Rung 4: OR_FALLBACK with coverage ranking.
        let hits = self.search_fts5_or(terms, filter, limit)?;
        let ranked = rank_by_coverage(hits, terms);
        let truncated: Vec<(MemoryItem, f64)> = ranked.into_iter().take(limit).collect();
        Ok(finish(
            truncated,
            SearchStrategy::OrFallback,
            terms,
            terms.to_vec(),
            vec![],
        ))
    }

    fn search_fts5_and(
        &self,
        terms: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<(MemoryItem, f64)>> {
        let fts_query = terms
            .iter()
            .map(|t| escape_term(t, false))
            .collect::<Vec<_>>()
            .join(" AND ");
        self.search_fts5_raw(&fts_query, filter, limit)
    }

    fn search_fts5_or(
        &self,
        terms: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<(MemoryItem, f64)>> {
        let fts_query = terms
            .iter()
            .map(|t| escape_term(t, false))
            .collect::<Vec<_>>()
            .join(" OR ");
        // Over-fetch before coverage ranking truncates.
        self.search_fts5_raw(&fts_query, filter, limit.saturating_mul(3))
    }

    fn search_fts5_prefix_and(
        &self,
        terms: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<(MemoryItem, f64)>> {
        let fts_query = terms
            .iter()
            .map(|t| escape_term(t, t.chars().count() >= PREFIX_MIN_LEN))
            .collect::<Vec<_>>()
            .join(" AND ");
        self.search_fts5_raw(&fts_query, filter, limit)
    }

    fn search_fts5_raw(
        &self,
        fts_query: &str,
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<(MemoryItem, f64)>> {
        let mut conditions = Vec::new();
        let mut bound: Vec<String> = Vec::new();
        if !filter.include_archived {
            conditions.push("i.archived = 0".to_string());
        }
        if let Some(tier) = filter.tier {
            conditions.push("i.tier = ?".to_string());
            bound.push(tier.as_str().to_string());
        }
        if let Some(ty) = filter.type_filter {
            conditions.push("i.type = ?".to_string());
            bound.push(ty.as_str().to_string());
        }
        if let Some(ref scope) = filter.scope {
            conditions.push("i.scope = ?".to_string());
            bound.push(scope.clone());
        }
        conditions.push("memory_items_fts MATCH ?".to_string());
        bound.push(fts_query.to_string());

        let sql = format!(
            "SELECT i.*, fts.rank AS fts_rank FROM memory_items i \
             JOIN memory_items_fts fts ON i.rowid = fts.rowid \
             WHERE {} ORDER BY fts.rank, i.id LIMIT {limit}",
            conditions.join(" AND ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            bound.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt
            .query_map(refs.as_slice(), |row| {
                let rank: f64 = row.get("fts_rank")?;
                Ok((row_to_item(row)?, rank))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Substring fallback when FTS is unavailable. Each term must appear in
    /// title, content, or tags (AND across terms). No ranking guarantee.
    fn search_like(
        &self,
        terms: &[String],
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let mut conditions = Vec::new();
        let mut bound: Vec<String> = Vec::new();
        if !filter.include_archived {
            conditions.push("archived = 0".to_string());
        }
        if let Some(tier) = filter.tier {
            conditions.push("tier = ?".to_string());
            bound.push(tier.as_str().to_string());
        }
        if let Some(ty) = filter.type_filter {
            conditions.push("type = ?".to_string());
            bound.push(ty.as_str().to_string());
        }
        if let Some(ref scope) = filter.scope {
            conditions.push("scope = ?".to_string());
            bound.push(scope.clone());
        }
        for term in terms {
            conditions.push("(title LIKE ? OR content LIKE ? OR tags LIKE ?)".to_string());
            let like = format!("%{term}%");
            bound.push(like.clone());
            bound.push(like.clone());
            bound.push(like);
        }

        let sql = format!(
            "SELECT * FROM memory_items WHERE {} \
             ORDER BY updated_at DESC, id DESC LIMIT {limit}",
            conditions.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> =
            bound.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let items = stmt
            .query_map(refs.as_slice(), row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

/// Quote a term for FTS5 MATCH; optional `*` suffix for prefix expansion.
fn escape_term(term: &str, prefix: bool) -> String {
    let safe = term.replace('"', "\"\"");
    if prefix {
        format!("\"{safe}\"*")
    } else {
        format!("\"{safe}\"")
    }
}

/// Coverage = number of distinct query terms present in title+content.
/// Stable sort keeps the underlying BM25 order on ties.
fn rank_by_coverage(
    hits: Vec<(MemoryItem, f64)>,
    terms: &[String],
) -> Vec<(MemoryItem, f64)> {
    let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
    let mut scored: Vec<(usize, (MemoryItem, f64))> = hits
        .into_iter()
        .map(|(item, rank)| {
            let text = format!("{} {}", item.title, item.content).to_lowercase();
            let coverage = lowered.iter().filter(|t| text.contains(t.as_str())).count();
            (coverage, (item, rank))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, pair)| pair).collect()
}

fn finish(
    hits: Vec<(MemoryItem, f64)>,
    strategy: SearchStrategy,
    original: &[String],
    effective: Vec<String>,
    dropped: Vec<String>,
) -> (Vec<MemoryItem>, SearchMeta) {
    let top_rank = hits.first().map(|(_, rank)| *rank);
    let items: Vec<MemoryItem> = hits.into_iter().map(|(item, _)| item).collect();
    let meta = SearchMeta {
        strategy,
        original_terms: original.to_vec(),
        effective_terms: effective,
        dropped_terms: dropped,
        total_candidates: items.len(),
        top_rank,
        morphological_hint: None,
    };
    (items, meta)
}
