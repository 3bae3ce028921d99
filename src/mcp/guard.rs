//! Path validation and resource caps — the first middleware layer.
//!
//! Rejects `..` segments before resolution, resolves symlinks, and checks
//! containment under the configured root. Enforces the per-call write size
//! cap, the per-minute aggregate write byte budget, and the import batch
//! cap. Logs only root-relative paths.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use crate::error::{MemctlError, Result};

pub const DEFAULT_MAX_WRITE_BYTES: usize = 65_536;
pub const DEFAULT_MAX_WRITE_BYTES_PER_MINUTE: usize = 524_288;
pub const DEFAULT_MAX_IMPORT_ITEMS: usize = 500;

struct WriteWindow {
    window_start: Instant,
    bytes: usize,
}

/// Path and resource guardrails for the MCP server.
pub struct ServerGuard {
    db_root: Option<PathBuf>,
    max_write_bytes: usize,
    max_write_bytes_per_minute: usize,
    max_import_items: usize,
    write_budgets: HashMap<String, WriteWindow>,
}

impl ServerGuard {
    pub fn new(db_root: Option<PathBuf>, max_write_bytes: usize) -> Self {
        let db_root = db_root.map(|root| root.canonicalize().unwrap_or(root));
        Self {
            db_root,
            max_write_bytes,
            max_write_bytes_per_minute: DEFAULT_MAX_WRITE_BYTES_PER_MINUTE,
            max_import_items: DEFAULT_MAX_IMPORT_ITEMS,
            write_budgets: HashMap::new(),
        }
    }

    pub fn db_root(&self) -> Option<&Path> {
        self.db_root.as_deref()
    }

    pub fn max_import_items(&self) -> usize {
        self.max_import_items
    }

    /// Resolve and validate a database path against the root.
    ///
    /// 1. Reject any `..` segment before resolution.
    /// 2. Resolve relative paths under the root (or cwd without one).
    /// 3. Canonicalize through the deepest existing ancestor so symlinks
    ///    cannot escape.
    /// 4. Check containment under the root.
    pub fn validate_db_path(&self, requested: &str) -> Result<PathBuf> {
        let raw = Path::new(requested);
        for component in raw.components() {
            if matches!(component, Component::ParentDir) {
                return Err(MemctlError::Validation(format!(
                    "path traversal rejected: '..' in path {requested:?}"
                )));
            }
        }

        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else if let Some(ref root) = self.db_root {
            root.join(raw)
        } else {
            std::env::current_dir()?.join(raw)
        };

        let resolved = resolve_through_existing(&joined);

        if let Some(ref root) = self.db_root {
            if !resolved.starts_with(root) {
                return Err(MemctlError::Validation(format!(
                    "path outside db-root: {:?} is not under {:?}",
                    resolved, root
                )));
            }
        }

        Ok(resolved)
    }

    /// Root-relative path string for audit logging. Never leaks an absolute
    /// path when a root is configured.
    pub fn relative_db_path(&self, resolved: &Path) -> String {
        if let Some(ref root) = self.db_root {
            if let Ok(rel) = resolved.strip_prefix(root) {
                return rel.to_string_lossy().to_string();
            }
        }
        resolved.to_string_lossy().to_string()
    }

    /// Per-call write size cap.
    pub fn check_write_size(&self, content: &str) -> Result<()> {
        self.check_write_bytes(content.len())
    }

    /// Per-call write size cap, byte-count form.
    pub fn check_write_bytes(&self, size: usize) -> Result<()> {
        if size > self.max_write_bytes {
            return Err(MemctlError::Validation(format!(
                "write size {size} bytes exceeds limit of {} bytes",
                self.max_write_bytes
            )));
        }
        Ok(())
    }

    /// Per-minute aggregate write byte budget, tracked per session.
    pub fn check_write_budget(&mut self, session_id: &str, content_bytes: usize) -> Result<()> {
        let now = Instant::now();
        let window = self.write_budgets.get(session_id);

        let fresh = match window {
            None => true,
            Some(w) => now.duration_since(w.window_start).as_secs() >= 60,
        };
        if fresh {
            self.write_budgets.insert(
                session_id.to_string(),
                WriteWindow {
                    window_start: now,
                    bytes: content_bytes,
                },
            );
            return Ok(());
        }

        let window = self.write_budgets.get_mut(session_id).unwrap();
        let new_total = window.bytes + content_bytes;
        if new_total > self.max_write_bytes_per_minute {
            return Err(MemctlError::Validation(format!(
                "write budget exceeded: {new_total} bytes in the current minute \
                 (limit: {} bytes/min)",
                self.max_write_bytes_per_minute
            )));
        }
        window.bytes = new_total;
        Ok(())
    }

    /// Import batch cap.
    pub fn check_import_batch(&self, count: usize) -> Result<()> {
        if count > self.max_import_items {
            return Err(MemctlError::Validation(format!(
                "import batch of {count} items exceeds limit of {}",
                self.max_import_items
            )));
        }
        Ok(())
    }
}

/// Canonicalize the deepest existing ancestor of a path and append the
/// rest unchanged. A `..`-free input cannot climb out lexically, and
/// symlinks in the existing prefix are resolved.
fn resolve_through_existing(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooted_guard() -> (tempfile::TempDir, ServerGuard) {
        let dir = tempfile::tempdir().unwrap();
        let guard = ServerGuard::new(Some(dir.path().to_path_buf()), DEFAULT_MAX_WRITE_BYTES);
        (dir, guard)
    }

    #[test]
    fn dotdot_rejected_before_resolution() {
        let (_dir, guard) = rooted_guard();
        let err = guard.validate_db_path("../escape/memory.db").unwrap_err();
        assert!(err.to_string().contains("traversal"));
        // Even a would-be-contained path with an internal ..
        assert!(guard.validate_db_path("a/../b.db").is_err());
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let (dir, guard) = rooted_guard();
        let resolved = guard.validate_db_path("project/memory.db").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(guard.relative_db_path(&resolved), "project/memory.db");
    }

    #[test]
    fn absolute_path_outside_root_rejected() {
        let (_dir, guard) = rooted_guard();
        let err = guard.validate_db_path("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("outside db-root"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_rejected() {
        let (dir, guard) = rooted_guard();
        let outside = tempfile::tempdir().unwrap();
        let link = dir.path().join("sneaky");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = guard.validate_db_path("sneaky/memory.db").unwrap_err();
        assert!(err.to_string().contains("outside db-root"));
    }

    #[test]
    fn no_root_accepts_any_clean_path() {
        let guard = ServerGuard::new(None, DEFAULT_MAX_WRITE_BYTES);
        assert!(guard.validate_db_path("/tmp/anywhere/memory.db").is_ok());
        assert!(guard.validate_db_path("../still/rejected.db").is_err());
    }

    #[test]
    fn write_size_cap_enforced() {
        let guard = ServerGuard::new(None, 10);
        assert!(guard.check_write_size("short").is_ok());
        assert!(guard.check_write_size("definitely more than ten").is_err());
    }

    #[test]
    fn write_budget_accumulates_per_session() {
        let mut guard = ServerGuard::new(None, DEFAULT_MAX_WRITE_BYTES);
        guard.max_write_bytes_per_minute = 100;

        assert!(guard.check_write_budget("s1", 60).is_ok());
        assert!(guard.check_write_budget("s1", 30).is_ok());
        assert!(guard.check_write_budget("s1", 30).is_err());
        // Other sessions are unaffected
        assert!(guard.check_write_budget("s2", 90).is_ok());
    }

    #[test]
    fn import_batch_cap() {
        let guard = ServerGuard::new(None, DEFAULT_MAX_WRITE_BYTES);
        assert!(guard.check_import_batch(500).is_ok());
        assert!(guard.check_import_batch(501).is_err());
    }
}
