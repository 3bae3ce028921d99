//! Query normalization, intent classification, and budget suggestion.
//!
//! Stop-word stripping keeps recall sharp for FTS queries while preserving
//! code identifiers verbatim (CamelCase, snake_case, UPPER_CASE, dotted
//! paths). Diacritics are left intact — folding is the tokenizer's job.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static FR_STOP_WORDS: &[&str] = &[
    "le", "la", "les", "un", "une", "des", "du", "de", "en", "dans", "pour", "avec", "sur", "par",
    "qui", "que", "est", "sont", "au", "aux", "ce", "cette", "ces", "se", "sa", "son", "ses", "ne",
    "pas", "ou", "et", "mais", "donc", "car", "ni", "si", "comme", "il", "elle", "on", "nous",
    "vous", "ils", "elles", "je", "tu", "mon", "ton", "notre", "votre", "leur", "leurs", "y",
    "dont", "où",
];

static EN_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "in", "on", "at", "to", "for", "of", "with", "by", "from", "is", "are",
    "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "can", "shall", "it", "its", "this", "that",
    "these", "those", "i", "me", "my", "we", "our", "you", "your", "he", "him", "his", "she",
    "her", "they", "them", "their", "not", "no", "nor", "so", "but", "or", "and", "if", "then",
    "about", "up", "out", "into", "over", "after", "before",
];

// Stripped from FTS queries but still used by mode classification.
static QUESTION_WORDS: &[&str] = &[
    "how", "what", "where", "when", "why", "which", "who", "whom", "comment", "quoi", "quel",
    "quelle", "quels", "quelles", "pourquoi",
];

static ALL_STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    FR_STOP_WORDS
        .iter()
        .chain(EN_STOP_WORDS)
        .chain(QUESTION_WORDS)
        .copied()
        .collect()
});

static CAMEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z][A-Z]").unwrap());
static SNAKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z]_[a-zA-Z]").unwrap());
static UPPER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]{1,}$").unwrap());

/// True when a token looks like a code identifier and must survive
/// normalization verbatim.
fn is_identifier(word: &str) -> bool {
    CAMEL_RE.is_match(word)
        || SNAKE_RE.is_match(word)
        || UPPER_RE.is_match(word)
        || (word.contains('.') && !word.ends_with('.'))
}

/// Strip stop words from an FTS query, preserving identifiers.
///
/// Never returns an empty string — a query made entirely of stop words
/// falls back to the original text.
pub fn normalize_query(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return text.to_string();
    }

    let kept: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| is_identifier(w) || !ALL_STOP_WORDS.contains(w.to_lowercase().as_str()))
        .collect();

    if kept.is_empty() {
        text.to_string()
    } else {
        kept.join(" ")
    }
}

/// Deterministic intent classes for a user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Exploration,
    Modification,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exploration => "exploration",
            Self::Modification => "modification",
        }
    }
}

static MODIFICATION_VERBS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "add", "replace", "refactor", "fix", "create", "delete", "update", "modify", "remove",
        "rename", "implement", "migrate", "upgrade", "configure", "install", "uninstall",
        "change", "move", "copy", "write", "rewrite", "patch", "merge", "split", "convert",
        "enable", "disable", "set", "reset",
        // French
        "ajouter", "remplacer", "corriger", "créer", "supprimer", "modifier", "renommer",
        "implémenter", "migrer", "configurer", "installer", "changer", "déplacer", "copier",
        "écrire", "réécrire", "activer", "désactiver",
    ]
    .into_iter()
    .collect()
});

static EXPLORATION_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "how", "where", "what", "which", "who", "whom", "explain", "describe", "show", "list",
        "find", "search", "understand", "trace", "check", "compare", "analyze", "review",
        "structure", "dependency", "module", "layer", "flow", "pattern", "architecture",
        "overview", "summary", "diagram",
        // French
        "comment", "où", "quel", "quelle", "quels", "quelles", "qui", "expliquer", "décrire",
        "montrer", "lister", "trouver", "chercher", "comprendre", "tracer", "vérifier",
        "comparer", "analyser",
    ]
    .into_iter()
    .collect()
});

/// Classify intent by first-verb matching. Modification verbs take priority
/// because modification prompts often contain exploration words too
/// ("explain how to add X" → modification). Tie and unmatched cases resolve
/// to exploration.
pub fn classify_mode(text: &str) -> QueryMode {
    let clean = |w: &str| {
        w.trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase()
    };

    for word in text.split_whitespace() {
        if MODIFICATION_VERBS.contains(clean(word).as_str()) {
            return QueryMode::Modification;
        }
    }
    for word in text.split_whitespace() {
        if EXPLORATION_WORDS.contains(clean(word).as_str()) {
            return QueryMode::Exploration;
        }
    }
    QueryMode::Exploration
}

/// Suggest an injection token budget proportional to question length.
/// Short questions get smaller budgets to prevent intent distortion.
pub fn suggest_budget(question_chars: usize) -> usize {
    match question_chars {
        0..=79 => 600,
        80..=199 => 800,
        200..=399 => 1200,
        _ => 1500,
    }
}

/// Indices into `terms`, ordered from first-to-drop to last-to-drop:
/// plain words before identifiers, shortest first, later position first on
/// ties. A length heuristic, adequate after stop-word removal; identifiers
/// are the most discriminating terms and go last.
pub fn drop_order(terms: &[String]) -> Vec<usize> {
    let mut indexed: Vec<(usize, &String)> = terms.iter().enumerate().collect();
    indexed.sort_by(|a, b| {
        is_identifier(a.1)
            .cmp(&is_identifier(b.1))
            .then(a.1.chars().count().cmp(&b.1.chars().count()))
            .then(b.0.cmp(&a.0))
    });
    indexed.into_iter().map(|(i, _)| i).collect()
}
