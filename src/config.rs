//! Configuration loading for memctl.
//!
//! A JSON config file is auto-detected next to the database (`config.json`).
//! Missing or invalid files silently fall back to compiled defaults.
//! Precedence: CLI flag > environment variable > config file > default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// FTS5 tokenizer presets exposed on the CLI and in config.
pub const FTS_TOKENIZER_PRESETS: &[(&str, &str)] = &[
    ("fr", "unicode61 remove_diacritics 2"),
    ("en", "porter unicode61 remove_diacritics 2"),
    ("raw", "unicode61"),
];

/// Resolve a preset name to its tokenizer string; unknown names pass through
/// as custom tokenizer strings.
pub fn resolve_tokenizer(name: &str) -> String {
    FTS_TOKENIZER_PRESETS
        .iter()
        .find(|(preset, _)| *preset == name)
        .map(|(_, tok)| tok.to_string())
        .unwrap_or_else(|| name.to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub wal_mode: bool,
    pub fts_tokenizer: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: ".memory/memory.db".into(),
            wal_mode: true,
            fts_tokenizer: "unicode61 remove_diacritics 2".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_content_length: usize,
    pub secret_patterns_enabled: bool,
    pub injection_patterns_enabled: bool,
    pub instructional_patterns_enabled: bool,
    pub pii_patterns_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_content_length: 2000,
            secret_patterns_enabled: true,
            injection_patterns_enabled: true,
            instructional_patterns_enabled: true,
            pii_patterns_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsolidateConfig {
    /// Minimum tag-Jaccard for two same-type items to cluster.
    pub cluster_similarity_threshold: f64,
    /// usage_count at or above which an MTM item is promoted to LTM.
    pub usage_count_for_ltm: u64,
    /// Types promoted to LTM regardless of usage.
    pub auto_promote_types: Vec<String>,
}

impl Default for ConsolidateConfig {
    fn default() -> Self {
        Self {
            cluster_similarity_threshold: 0.7,
            usage_count_for_ltm: 5,
            auto_promote_types: vec![
                "constraint".into(),
                "decision".into(),
                "definition".into(),
            ],
        }
    }
}

/// Observation thresholds for structural inspect. The semantics of each
/// threshold are frozen; only the values are configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    pub dominance_frac: f64,
    pub low_density_threshold: f64,
    pub ext_concentration_frac: f64,
    pub sparse_threshold: u64,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            dominance_frac: 0.40,
            low_density_threshold: 0.10,
            ext_concentration_frac: 0.75,
            sparse_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum history turns kept in the sliding session window.
    pub history_max: usize,
    /// Character budget for the session window (both limits enforced).
    pub history_char_budget: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_max: 20,
            history_char_budget: 16_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_calls: u32,
    pub threshold: f64,
    pub query_threshold: f64,
    pub stable_steps: u32,
    pub timeout_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_calls: 3,
            threshold: 0.92,
            query_threshold: 0.90,
            stable_steps: 2,
            timeout_secs: 300,
        }
    }
}

/// Top-level memctl configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemctlConfig {
    pub store: StoreConfig,
    pub policy: PolicyConfig,
    pub consolidate: ConsolidateConfig,
    pub inspect: InspectConfig,
    pub chat: ChatConfig,
    #[serde(rename = "loop")]
    pub loop_cfg: LoopConfig,
}

impl MemctlConfig {
    /// Load from an explicit path, or auto-detect `config.json` next to the
    /// database. Any parse or I/O failure falls back to defaults.
    pub fn load(config_path: Option<&Path>, db_path: &Path) -> Self {
        let candidate = match config_path {
            Some(p) => p.to_path_buf(),
            None => db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("config.json"),
        };

        let mut config = match std::fs::read_to_string(&candidate) {
            Ok(contents) => match serde_json::from_str::<MemctlConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(e) => {
                    debug!(path = %candidate.display(), error = %e, "invalid config, using defaults");
                    MemctlConfig::default()
                }
            },
            Err(_) => MemctlConfig::default(),
        };

        config.apply_env_overrides();
        config
    }

    /// Apply `MEMCTL_*` environment overrides (between file and CLI flag in
    /// precedence).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMCTL_DB") {
            self.store.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMCTL_FTS") {
            self.store.fts_tokenizer = resolve_tokenizer(&val);
        }
    }

    /// Range-check all sections. Empty vec means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let check = |errors: &mut Vec<String>, name: &str, value: f64, lo: f64, hi: f64| {
            if !(lo..=hi).contains(&value) {
                errors.push(format!("{name}: {value} not in [{lo}, {hi}]"));
            }
        };
        check(
            &mut errors,
            "consolidate.cluster_similarity_threshold",
            self.consolidate.cluster_similarity_threshold,
            0.0,
            1.0,
        );
        check(
            &mut errors,
            "inspect.dominance_frac",
            self.inspect.dominance_frac,
            0.01,
            1.0,
        );
        check(
            &mut errors,
            "inspect.low_density_threshold",
            self.inspect.low_density_threshold,
            0.0,
            1.0,
        );
        check(
            &mut errors,
            "inspect.ext_concentration_frac",
            self.inspect.ext_concentration_frac,
            0.01,
            1.0,
        );
        check(&mut errors, "loop.threshold", self.loop_cfg.threshold, 0.0, 1.0);
        check(
            &mut errors,
            "loop.query_threshold",
            self.loop_cfg.query_threshold,
            0.0,
            1.0,
        );
        if self.policy.max_content_length < 100 {
            errors.push(format!(
                "policy.max_content_length: {} below minimum 100",
                self.policy.max_content_length
            ));
        }
        errors
    }
}

/// Resolve the database path: CLI flag > `MEMCTL_DB` > default.
pub fn resolve_db_path(flag: Option<&str>) -> PathBuf {
    if let Some(p) = flag {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var("MEMCTL_DB") {
        return PathBuf::from(p);
    }
    PathBuf::from(".memory/memory.db")
}

/// Resolve the injection budget: CLI flag > `MEMCTL_BUDGET` > default 2200.
pub fn resolve_budget(flag: Option<usize>) -> usize {
    if let Some(b) = flag {
        return b;
    }
    std::env::var("MEMCTL_BUDGET")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2200)
}

/// Platform data directory for chat history (`~/.local/share/memctl`).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memctl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MemctlConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.policy.max_content_length, 2000);
        assert_eq!(config.inspect.dominance_frac, 0.40);
        assert_eq!(config.loop_cfg.max_calls, 3);
        assert_eq!(
            config.store.fts_tokenizer,
            "unicode61 remove_diacritics 2"
        );
    }

    #[test]
    fn tokenizer_presets_resolve() {
        assert_eq!(resolve_tokenizer("fr"), "unicode61 remove_diacritics 2");
        assert_eq!(
            resolve_tokenizer("en"),
            "porter unicode61 remove_diacritics 2"
        );
        assert_eq!(resolve_tokenizer("raw"), "unicode61");
        // Unknown names pass through as custom tokenizer strings
        assert_eq!(resolve_tokenizer("ascii"), "ascii");
    }

    #[test]
    fn parse_partial_json_keeps_defaults() {
        let json = r#"{"inspect": {"dominance_frac": 0.5}, "chat": {"history_max": 5}}"#;
        let config: MemctlConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.inspect.dominance_frac, 0.5);
        assert_eq!(config.chat.history_max, 5);
        // Untouched sections keep defaults
        assert_eq!(config.inspect.ext_concentration_frac, 0.75);
        assert_eq!(config.policy.max_content_length, 2000);
    }

    #[test]
    fn invalid_config_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join("memctl-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let bad = dir.join("config.json");
        std::fs::write(&bad, "{not json").unwrap();
        let config = MemctlConfig::load(Some(&bad), Path::new(".memory/memory.db"));
        assert_eq!(config.policy.max_content_length, 2000);
        std::fs::remove_file(&bad).ok();
    }

    #[test]
    fn validate_flags_out_of_range() {
        let mut config = MemctlConfig::default();
        config.inspect.dominance_frac = 1.5;
        config.loop_cfg.threshold = -0.1;
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }
}
