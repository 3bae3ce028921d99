//! Deterministic text similarity for loop convergence and cycle detection.
//!
//! Two complementary measures, combined by simple average:
//! - token-level Jaccard (order-insensitive set overlap)
//! - longest-common-subsequence ratio (order-sensitive, character level)

/// Lowercase, strip punctuation to spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn token_set(text: &str) -> std::collections::HashSet<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-level Jaccard similarity: |A ∩ B| / |A ∪ B|.
///
/// Both empty → 1.0 (vacuous similarity); one empty → 0.0.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let ta = token_set(a);
    let tb = token_set(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    inter as f64 / union as f64
}

/// LCS length over two char slices, two-row DP.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut curr = vec![0usize; short.len() + 1];
    for &lc in long {
        for (j, &sc) in short.iter().enumerate() {
            curr[j + 1] = if lc == sc {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// Longest-common-subsequence ratio in [0, 1]: `2·LCS / (|a| + |b|)`
/// over normalized text.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let na: Vec<char> = normalize(a).chars().collect();
    let nb: Vec<char> = normalize(b).chars().collect();
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(&na, &nb);
    2.0 * lcs as f64 / (na.len() + nb.len()) as f64
}

/// Combined score: simple average of Jaccard and LCS ratio.
pub fn similarity(a: &str, b: &str) -> f64 {
    (jaccard(a, b) + lcs_ratio(a, b)) / 2.0
}

/// Two answers similar enough to declare convergence.
pub fn is_fixed_point(a: &str, b: &str, threshold: f64) -> bool {
    similarity(a, b) >= threshold
}

/// A refined query repeats (or nearly repeats) a prior query.
///
/// Exact normalized match against any historical query, or similarity above
/// `threshold` against the most recent one. Empty queries count as cycles.
pub fn is_query_cycle(query: &str, history: &[String], threshold: f64) -> bool {
    let norm_query = normalize(query);
    if norm_query.is_empty() {
        return true;
    }
    if history.iter().any(|prev| normalize(prev) == norm_query) {
        return true;
    }
    match history.last() {
        Some(last) => similarity(query, last) >= threshold,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello,  World!"), "hello world");
        assert_eq!(normalize("  "), "");
        assert_eq!(normalize("a_b"), "a b");
    }

    #[test]
    fn jaccard_bounds() {
        assert_eq!(jaccard("", ""), 1.0);
        assert_eq!(jaccard("abc", ""), 0.0);
        assert_eq!(jaccard("the cat sat", "the cat sat"), 1.0);
        let j = jaccard("the cat sat", "the dog sat");
        assert!(j > 0.0 && j < 1.0);
    }

    #[test]
    fn lcs_ratio_identical_is_one() {
        assert_eq!(lcs_ratio("same text here", "same text here"), 1.0);
        assert_eq!(lcs_ratio("", ""), 1.0);
        assert_eq!(lcs_ratio("abc", ""), 0.0);
    }

    #[test]
    fn lcs_ratio_partial_overlap() {
        let r = lcs_ratio("abcdef", "abdf");
        // LCS("abcdef","abdf") = "abdf" → 2*4/(6+4) = 0.8
        assert!((r - 0.8).abs() < 1e-9);
    }

    #[test]
    fn identical_answers_are_a_fixed_point() {
        assert!(is_fixed_point("the answer is 42", "the answer is 42", 0.92));
        assert!(!is_fixed_point(
            "the answer is 42",
            "completely different topic entirely",
            0.92
        ));
    }

    #[test]
    fn paraphrase_scores_high() {
        let a = "WAL mode allows concurrent readers with a single writer";
        let b = "WAL mode allows concurrent readers with one writer";
        assert!(similarity(a, b) > 0.8);
    }

    #[test]
    fn query_cycle_exact_match_anywhere_in_history() {
        let history = vec!["first query".to_string(), "second query".to_string()];
        assert!(is_query_cycle("First Query!", &history, 0.90));
        assert!(is_query_cycle("second   query", &history, 0.90));
        assert!(!is_query_cycle("unrelated topic search", &history, 0.90));
    }

    #[test]
    fn query_cycle_near_match_only_against_latest() {
        let history = vec![
            "database schema migrations".to_string(),
            "fts index tokenizers".to_string(),
        ];
        // Near-duplicate of latest → cycle
        assert!(is_query_cycle("fts index tokenizer", &history, 0.80));
        // Near-duplicate of an *older* entry is not a near-match cycle
        // (only exact matches count beyond the most recent query)
        assert!(!is_query_cycle("databases schema migration plans", &history, 0.95));
    }

    #[test]
    fn empty_query_is_a_cycle() {
        assert!(is_query_cycle("", &[], 0.90));
        assert!(is_query_cycle("  ...  ", &[], 0.90));
    }
}
