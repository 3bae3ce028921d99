use std::io::Read;

use super::{CliContext, CmdResult};
use memctl::error::MemctlError;
use memctl::memory::types::{MemoryProposal, Provenance, SourceKind};
use memctl::proposer::{commit_proposal, CommitOutcome};

/// Store stdin content as a single governed item. Exits 1 on policy
/// rejection or empty input.
pub fn run(ctx: &CliContext, title: Option<&str>, scope: &str, tags: &[String]) -> CmdResult {
    let mut content = String::new();
    std::io::stdin().lock().read_to_string(&mut content)?;
    let content = content.trim_end().to_string();
    if content.is_empty() {
        return Err(MemctlError::Validation("empty input on stdin".into()).into());
    }

    let mut store = ctx.open_store()?;
    let policy = ctx.policy();

    let proposal = MemoryProposal {
        item_type: None,
        title: title.unwrap_or("pulled").to_string(),
        content,
        tags: tags.to_vec(),
        why_store: "pulled from stdin".into(),
        scope: scope.to_string(),
        provenance: Provenance {
            source_kind: SourceKind::Chat,
            source_id: "<stdin>".into(),
            ..Default::default()
        },
    };

    match commit_proposal(&mut store, &policy, proposal, "pull")? {
        CommitOutcome::Stored { id, quarantined, .. } => {
            if quarantined {
                ctx.progress("[pull] stored quarantined (non-injectable)");
            }
            println!("{id}");
            Ok(0)
        }
        CommitOutcome::Rejected { rule_id, reason } => {
            Err(MemctlError::PolicyRejected { rule_id, reason }.into())
        }
    }
}
