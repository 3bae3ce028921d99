//! MCP serving layer: explicit server context and the middleware stack
//! (guard → session → rate limit → tool execute → audit).

pub mod audit;
pub mod guard;
pub mod rate_limiter;
pub mod session;
pub mod tools;

use std::sync::Mutex;

use crate::config::MemctlConfig;
use crate::extract::ExtractorRegistry;
use crate::memory::store::MemoryStore;
use crate::policy::MemoryPolicy;

/// Everything a tool handler needs, owned by the entry point and passed
/// explicitly. No process-wide mutable state survives process exit except
/// the database file.
pub struct ServerContext {
    pub store: Mutex<MemoryStore>,
    pub policy: MemoryPolicy,
    pub config: MemctlConfig,
    pub guard: Mutex<guard::ServerGuard>,
    pub sessions: Mutex<session::SessionTracker>,
    pub limiter: Option<Mutex<rate_limiter::RateLimiter>>,
    pub audit: audit::AuditLogger,
    pub extractors: ExtractorRegistry,
    /// Root-relative database path for audit records.
    pub db_display: String,
    /// Default LLM command for ask/loop tools, when configured.
    pub llm_cmd: Option<String>,
}
