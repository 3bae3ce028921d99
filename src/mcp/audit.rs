//! Structured JSONL audit logging for MCP tool calls — schema v1.
//!
//! One record per tool call, success or failure. Fields may be added under
//! SemVer, never removed. Privacy rule: raw content is never logged — only
//! a 120-char preview, the content SHA-256, and the byte length. Emission
//! is fire-and-forget: audit failures never disrupt tool execution.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Mutex;

pub const AUDIT_SCHEMA_VERSION: u32 = 1;
pub const PREVIEW_MAX_CHARS: usize = 120;

/// Tool call outcomes — the closed v1 set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Ok,
    Error,
    Blocked,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }
}

enum Sink {
    Stderr,
    File(std::fs::File),
}

/// JSONL audit logger. Writes to stderr by default or an append-only file.
pub struct AuditLogger {
    sink: Mutex<Sink>,
}

impl AuditLogger {
    pub fn stderr() -> Self {
        Self {
            sink: Mutex::new(Sink::Stderr),
        }
    }

    pub fn file(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            sink: Mutex::new(Sink::File(file)),
        })
    }

    /// Generate a request id correlating the tool calls of one MCP request.
    pub fn new_rid() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Write one audit record. Fire-and-forget — never returns an error.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        tool: &str,
        rid: &str,
        session_id: &str,
        db_path: &str,
        outcome: AuditOutcome,
        detail: Option<serde_json::Value>,
        elapsed_ms: f64,
    ) {
        let mut record = serde_json::json!({
            "v": AUDIT_SCHEMA_VERSION,
            "ts": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "rid": rid,
            "tool": tool,
            "sid": session_id,
            "db": db_path,
            "outcome": outcome.as_str(),
            "ms": (elapsed_ms * 10.0).round() / 10.0,
        });
        if let Some(d) = detail {
            record["d"] = d;
        }

        // Swallow every failure: audit must not disrupt tool execution.
        let _ = (|| -> std::io::Result<()> {
            let line = record.to_string();
            let mut sink = self
                .sink
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?;
            match &mut *sink {
                Sink::Stderr => {
                    let stderr = std::io::stderr();
                    let mut handle = stderr.lock();
                    writeln!(handle, "{line}")?;
                }
                Sink::File(file) => {
                    writeln!(file, "{line}")?;
                    file.flush()?;
                }
            }
            Ok(())
        })();
    }

    /// Safe detail fields for content-carrying tools: byte length, SHA-256,
    /// and a 120-char preview with newlines flattened.
    pub fn content_detail(content: &str) -> serde_json::Value {
        let bytes = content.len();
        let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
        let mut preview: String = content
            .chars()
            .take(PREVIEW_MAX_CHARS)
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        if content.chars().count() > PREVIEW_MAX_CHARS {
            preview = format!("{}…", preview.trim_end());
        }
        serde_json::json!({
            "bytes": bytes,
            "hash": hash,
            "preview": preview,
        })
    }
}
