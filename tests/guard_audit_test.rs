//! Path-guard and audit-schema properties.

mod helpers;

use memctl::mcp::audit::{AuditLogger, AuditOutcome};
use memctl::mcp::guard::ServerGuard;

#[test]
fn dotdot_paths_rejected_before_resolution() {
    let root = tempfile::tempdir().unwrap();
    let guard = ServerGuard::new(Some(root.path().to_path_buf()), 65_536);

    for bad in [
        "../outside.db",
        "a/../../b.db",
        "..",
        "nested/../../../etc/shadow",
    ] {
        let err = guard.validate_db_path(bad).unwrap_err();
        assert!(
            err.to_string().contains("traversal"),
            "{bad} must be rejected pre-resolution"
        );
    }
}

#[test]
fn resolved_paths_outside_root_rejected() {
    let root = tempfile::tempdir().unwrap();
    let guard = ServerGuard::new(Some(root.path().to_path_buf()), 65_536);

    assert!(guard.validate_db_path("/var/lib/other.db").is_err());
    let ok = guard.validate_db_path("inside/memory.db").unwrap();
    assert!(ok.starts_with(root.path().canonicalize().unwrap()));
}

#[test]
fn audit_records_share_schema_and_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let logger = AuditLogger::file(&path).unwrap();

    // One MCP request spanning multiple tools shares one rid
    let rid = AuditLogger::new_rid();
    logger.log("memory_recall", &rid, "sess-1", "db", AuditOutcome::Ok, None, 1.0);
    logger.log(
        "memory_propose",
        &rid,
        "sess-1",
        "db",
        AuditOutcome::Blocked,
        Some(serde_json::json!({"policy": "secret.github-pat"})),
        2.0,
    );
    logger.log("memory_stats", &rid, "sess-1", "db", AuditOutcome::Error, None, 0.2);

    let contents = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    // One record per call, all correlated by rid, schema v1 fields present
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record["v"], 1);
        assert_eq!(record["rid"], rid.as_str());
        for field in ["ts", "tool", "sid", "db", "outcome", "ms"] {
            assert!(record.get(field).is_some(), "missing field {field}");
        }
    }
    let outcomes: Vec<&str> = records
        .iter()
        .map(|r| r["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["ok", "blocked", "error"]);
}

#[test]
fn audit_preview_never_exceeds_privacy_budget() {
    let long_secret_adjacent = "x".repeat(10_000);
    let detail = AuditLogger::content_detail(&long_secret_adjacent);
    assert!(detail["preview"].as_str().unwrap().chars().count() <= 121);
    assert_eq!(detail["bytes"], 10_000);
}
