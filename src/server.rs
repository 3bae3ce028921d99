//! MCP server initialization over stdio transport.
//!
//! Wires the store, policy engine, and middleware stack into a
//! [`ServerContext`] owned by the entry point, then serves the tool router.

use rmcp::ServiceExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::MemctlConfig;
use crate::error::{MemctlError, Result};
use crate::extract::ExtractorRegistry;
use crate::mcp::audit::AuditLogger;
use crate::mcp::guard::{ServerGuard, DEFAULT_MAX_WRITE_BYTES};
use crate::mcp::rate_limiter::RateLimiter;
use crate::mcp::session::SessionTracker;
use crate::mcp::tools::MemctlTools;
use crate::mcp::ServerContext;
use crate::memory::store::MemoryStore;
use crate::policy::MemoryPolicy;

/// Server wiring options, resolved from CLI flags and environment.
pub struct ServeOptions {
    pub db_path: PathBuf,
    pub db_root: Option<PathBuf>,
    pub max_write_bytes: usize,
    pub rate_limit: bool,
    pub writes_per_minute: u32,
    pub reads_per_minute: u32,
    pub audit_log: Option<PathBuf>,
    pub llm_cmd: Option<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".memory/memory.db"),
            db_root: None,
            max_write_bytes: DEFAULT_MAX_WRITE_BYTES,
            rate_limit: true,
            writes_per_minute: 20,
            reads_per_minute: 120,
            audit_log: None,
            llm_cmd: None,
        }
    }
}

/// Build the server context: guard-validated database path, store, policy,
/// session tracker, rate limiter, and audit logger.
pub fn build_context(config: MemctlConfig, opts: &ServeOptions) -> Result<Arc<ServerContext>> {
    let guard = ServerGuard::new(opts.db_root.clone(), opts.max_write_bytes);
    let db_path = guard.validate_db_path(&opts.db_path.to_string_lossy())?;
    let db_display = guard.relative_db_path(&db_path);

    let store = MemoryStore::open(&db_path, config.store.wal_mode, &config.store.fts_tokenizer)?;
    tracing::info!(db = %db_display, fts = store.fts_enabled(), "store ready");

    let limiter = opts.rate_limit.then(|| {
        Mutex::new(RateLimiter::new(
            opts.writes_per_minute,
            opts.reads_per_minute,
            2.0,
            5,
        ))
    });

    let audit = match opts.audit_log {
        Some(ref path) => AuditLogger::file(path).map_err(MemctlError::Io)?,
        None => AuditLogger::stderr(),
    };

    Ok(Arc::new(ServerContext {
        store: Mutex::new(store),
        policy: MemoryPolicy::new(config.policy.clone()),
        config,
        guard: Mutex::new(guard),
        sessions: Mutex::new(SessionTracker::new()),
        limiter,
        audit,
        extractors: ExtractorRegistry::new(),
        db_display,
        llm_cmd: opts.llm_cmd.clone(),
    }))
}

/// Start the MCP server over stdio. stdout carries JSON-RPC; everything
/// else goes to stderr.
pub async fn serve_stdio(config: MemctlConfig, opts: ServeOptions) -> Result<()> {
    tracing::info!("starting memctl MCP server on stdio");

    let ctx = build_context(config, &opts)?;
    let tools = MemctlTools::new(ctx);
    let transport = rmcp::transport::stdio();

    let server = tools
        .serve(transport)
        .await
        .map_err(|e| MemctlError::Fatal(format!("MCP transport failed: {e}")))?;
    tracing::info!("MCP server running — waiting for client");

    server
        .waiting()
        .await
        .map_err(|e| MemctlError::Fatal(format!("MCP server failed: {e}")))?;
    tracing::info!("MCP server shut down");

    Ok(())
}
