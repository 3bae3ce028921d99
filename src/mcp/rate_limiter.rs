//! Token-bucket throttling for MCP tool calls.
//!
//! One bucket per (session, tool class). Two classes: write tools
//! (20/min default) and read tools (120/min default); `memory_stats` and
//! `memory_mount` metadata operations are exempt. Burst factor ×2. Imports
//! consume one token per item. Single-threaded cooperative scheduling — no
//! locks needed beyond the context-level mutex.

use std::collections::HashMap;
use std::time::Instant;

pub const WRITE_TOOLS: &[&str] = &[
    "memory_write",
    "memory_propose",
    "memory_import",
    "memory_consolidate",
    "memory_sync",
    "memory_reindex",
];
pub const READ_TOOLS: &[&str] = &[
    "memory_recall",
    "memory_search",
    "memory_read",
    "memory_export",
    "memory_inspect",
    "memory_ask",
    "memory_loop",
];
pub const EXEMPT_TOOLS: &[&str] = &["memory_stats", "memory_mount"];

/// Tool classification for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Write,
    Read,
    Exempt,
}

pub fn classify_tool(tool_name: &str) -> ToolClass {
    if WRITE_TOOLS.contains(&tool_name) {
        ToolClass::Write
    } else if READ_TOOLS.contains(&tool_name) {
        ToolClass::Read
    } else {
        ToolClass::Exempt
    }
}

/// Raised when a bucket runs dry; carries the suggested retry delay.
#[derive(Debug)]
pub struct RateLimitExceeded {
    pub retry_after_ms: u64,
    pub message: String,
}

impl std::fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RateLimitExceeded {}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Consume n tokens; returns 0 on success, else milliseconds to wait.
    fn try_consume(&mut self, n: f64) -> u64 {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            return 0;
        }
        let deficit = n - self.tokens;
        if self.refill_rate > 0.0 {
            (deficit / self.refill_rate * 1000.0) as u64
        } else {
            60_000
        }
    }
}

struct SessionBuckets {
    read: Bucket,
    write: Bucket,
    proposals_this_turn: usize,
}

/// Token-bucket rate limiter keyed by session.
pub struct RateLimiter {
    writes_per_minute: u32,
    reads_per_minute: u32,
    burst_factor: f64,
    max_proposals_per_turn: usize,
    sessions: HashMap<String, SessionBuckets>,
}

impl RateLimiter {
    pub fn new(
        writes_per_minute: u32,
        reads_per_minute: u32,
        burst_factor: f64,
        max_proposals_per_turn: usize,
    ) -> Self {
        Self {
            writes_per_minute,
            reads_per_minute,
            burst_factor,
            max_proposals_per_turn,
            sessions: HashMap::new(),
        }
    }

    fn buckets(&mut self, session_id: &str) -> &mut SessionBuckets {
        let writes = self.writes_per_minute;
        let reads = self.reads_per_minute;
        let burst = self.burst_factor;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuckets {
                read: Bucket::new(f64::from(reads) * burst, f64::from(reads) / 60.0),
                write: Bucket::new(f64::from(writes) * burst, f64::from(writes) / 60.0),
                proposals_this_turn: 0,
            })
    }

    pub fn check_read(&mut self, session_id: &str) -> Result<(), RateLimitExceeded> {
        let reads = self.reads_per_minute;
        let wait = self.buckets(session_id).read.try_consume(1.0);
        if wait > 0 {
            return Err(RateLimitExceeded {
                retry_after_ms: wait,
                message: format!("read rate limit exceeded ({reads}/min); retry after {wait}ms"),
            });
        }
        Ok(())
    }

    pub fn check_write(&mut self, session_id: &str) -> Result<(), RateLimitExceeded> {
        self.check_write_n(session_id, 1)
    }

    /// Consume n write tokens at once (import batches).
    pub fn check_write_n(&mut self, session_id: &str, n: usize) -> Result<(), RateLimitExceeded> {
        let writes = self.writes_per_minute;
        let wait = self.buckets(session_id).write.try_consume(n as f64);
        if wait > 0 {
            return Err(RateLimitExceeded {
                retry_after_ms: wait,
                message: format!(
                    "write rate limit exceeded ({writes}/min, {n} requested); retry after {wait}ms"
                ),
            });
        }
        Ok(())
    }

    /// Per-turn proposal cap.
    pub fn check_proposals(
        &mut self,
        session_id: &str,
        count: usize,
    ) -> Result<(), RateLimitExceeded> {
        let cap = self.max_proposals_per_turn;
        let buckets = self.buckets(session_id);
        if buckets.proposals_this_turn + count > cap {
            return Err(RateLimitExceeded {
                retry_after_ms: 0,
                message: format!(
                    "proposal limit exceeded: {} this turn (limit: {cap})",
                    buckets.proposals_this_turn + count
                ),
            });
        }
        buckets.proposals_this_turn += count;
        Ok(())
    }

    /// Reset per-turn counters at a turn boundary.
    pub fn reset_turn(&mut self, session_id: &str) {
        if let Some(buckets) = self.sessions.get_mut(session_id) {
            buckets.proposals_this_turn = 0;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(20, 120, 2.0, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_locked() {
        assert_eq!(classify_tool("memory_write"), ToolClass::Write);
        assert_eq!(classify_tool("memory_sync"), ToolClass::Write);
        assert_eq!(classify_tool("memory_reindex"), ToolClass::Write);
        assert_eq!(classify_tool("memory_recall"), ToolClass::Read);
        assert_eq!(classify_tool("memory_ask"), ToolClass::Read);
        assert_eq!(classify_tool("memory_stats"), ToolClass::Exempt);
        assert_eq!(classify_tool("memory_mount"), ToolClass::Exempt);
    }

    #[test]
    fn burst_allows_double_then_refuses() {
        let mut limiter = RateLimiter::new(10, 120, 2.0, 5);
        // Capacity is 10 × 2 = 20 writes
        for _ in 0..20 {
            limiter.check_write("s1").unwrap();
        }
        let err = limiter.check_write("s1").unwrap_err();
        assert!(err.retry_after_ms > 0);
    }

    #[test]
    fn sessions_have_independent_buckets() {
        let mut limiter = RateLimiter::new(1, 120, 1.0, 5);
        limiter.check_write("s1").unwrap();
        assert!(limiter.check_write("s1").is_err());
        // s2 untouched
        limiter.check_write("s2").unwrap();
    }

    #[test]
    fn batch_import_consumes_per_item() {
        let mut limiter = RateLimiter::new(10, 120, 2.0, 5);
        limiter.check_write_n("s1", 15).unwrap();
        assert!(limiter.check_write_n("s1", 10).is_err());
        limiter.check_write_n("s1", 5).unwrap();
    }

    #[test]
    fn proposal_cap_resets_per_turn() {
        let mut limiter = RateLimiter::new(100, 120, 2.0, 5);
        limiter.check_proposals("s1", 3).unwrap();
        limiter.check_proposals("s1", 2).unwrap();
        assert!(limiter.check_proposals("s1", 1).is_err());

        limiter.reset_turn("s1");
        limiter.check_proposals("s1", 5).unwrap();
    }

    #[test]
    fn reads_and_writes_are_separate_classes() {
        let mut limiter = RateLimiter::new(1, 100, 1.0, 5);
        limiter.check_write("s1").unwrap();
        assert!(limiter.check_write("s1").is_err());
        // Reads still flow
        for _ in 0..10 {
            limiter.check_read("s1").unwrap();
        }
    }
}
