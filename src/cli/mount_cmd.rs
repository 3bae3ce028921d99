use std::path::Path;

use super::{CliContext, CmdResult};
use memctl::error::MemctlError;
use memctl::mount::register_mount;

/// Mount management: register, list, or remove.
pub fn run(
    ctx: &CliContext,
    path: Option<&Path>,
    name: Option<&str>,
    ignore: &[String],
    list: bool,
    remove: Option<&str>,
) -> CmdResult {
    let mut store = ctx.open_store()?;

    if list {
        let mounts = store.list_mounts()?;
        ctx.emit(&mounts, || {
            mounts
                .iter()
                .map(|m| {
                    format!(
                        "{}  {}  (name: {}, last sync: {})",
                        m.mount_id,
                        m.path,
                        m.name.as_deref().unwrap_or("-"),
                        m.last_sync_at.as_deref().unwrap_or("never")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
        return Ok(0);
    }

    if let Some(key) = remove {
        let removed = store.remove_mount(key)?;
        if removed {
            ctx.progress(&format!("[mount] removed {key}"));
            Ok(0)
        } else {
            Err(MemctlError::Validation(format!("unknown mount: {key}")).into())
        }
    } else {
        let path = path.ok_or_else(|| {
            MemctlError::Validation("a folder path is required (or --list / --remove)".into())
        })?;
        let mount_id = register_mount(&mut store, path, name, ignore, None)?;
        println!("{mount_id}");
        Ok(0)
    }
}
