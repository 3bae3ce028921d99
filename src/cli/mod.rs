//! CLI command handlers, one module per subcommand.
//!
//! Shared contract: stdout carries data (injection blocks, JSON, answers);
//! stderr carries progress and diagnostics. Handlers return the process
//! exit code: 0 success (including idempotent no-ops), 1 operational error,
//! 2 internal failure.

pub mod ask_cmd;
pub mod chat_cmd;
pub mod consolidate;
pub mod export;
pub mod import;
pub mod init;
pub mod inspect_cmd;
pub mod loop_cmd;
pub mod mount_cmd;
pub mod pull;
pub mod push;
pub mod reindex;
pub mod search;
pub mod serve;
pub mod show;
pub mod stats;
pub mod sync_cmd;

use std::path::{Path, PathBuf};

use memctl::config::{resolve_db_path, MemctlConfig};
use memctl::extract::ExtractorRegistry;
use memctl::memory::store::MemoryStore;
use memctl::policy::MemoryPolicy;

/// Shared per-invocation context: resolved paths, loaded config, and
/// output flags.
pub struct CliContext {
    pub db_path: PathBuf,
    pub config: MemctlConfig,
    pub json: bool,
    pub quiet: bool,
}

impl CliContext {
    pub fn new(db_flag: Option<&str>, config_flag: Option<&Path>, json: bool, quiet: bool) -> Self {
        let db_path = resolve_db_path(db_flag);
        let config = MemctlConfig::load(config_flag, &db_path);
        Self {
            db_path,
            config,
            json,
            quiet,
        }
    }

    pub fn open_store(&self) -> memctl::error::Result<MemoryStore> {
        MemoryStore::open(
            &self.db_path,
            self.config.store.wal_mode,
            &self.config.store.fts_tokenizer,
        )
    }

    pub fn policy(&self) -> MemoryPolicy {
        MemoryPolicy::new(self.config.policy.clone())
    }

    pub fn extractors(&self) -> ExtractorRegistry {
        ExtractorRegistry::new()
    }

    /// Progress message to stderr unless quiet.
    pub fn progress(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{msg}");
        }
    }

    /// Data to stdout, as JSON when requested.
    pub fn emit<T: serde::Serialize>(&self, value: &T, human: impl FnOnce() -> String) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".into())
            );
        } else {
            println!("{}", human());
        }
    }
}

/// Convention alias for command handlers: exit code on success.
pub type CmdResult = anyhow::Result<i32>;
