//! Folder registration for structured sync.
//!
//! Mount registration is metadata-only: no file scanning, no ingestion.
//! Content sync lives in the sync module.

use std::path::Path;

use crate::error::{MemctlError, Result};
use crate::memory::store::MemoryStore;
use crate::memory::types::MountRecord;

/// Register a folder as a mount point. The path is canonicalized first;
/// re-registering the same canonical path returns the existing mount id.
pub fn register_mount(
    store: &mut MemoryStore,
    folder_path: &Path,
    name: Option<&str>,
    ignore_patterns: &[String],
    lang_hint: Option<&str>,
) -> Result<String> {
    let canonical = folder_path.canonicalize().map_err(|_| {
        MemctlError::Validation(format!("mount path does not exist: {}", folder_path.display()))
    })?;
    if !canonical.is_dir() {
        return Err(MemctlError::Validation(format!(
            "mount path is not a directory: {}",
            canonical.display()
        )));
    }

    let mount_id = store.write_mount(
        &canonical.to_string_lossy(),
        name,
        ignore_patterns,
        lang_hint,
    )?;
    tracing::info!(mount_id = %mount_id, path = %canonical.display(), "mount registered");
    Ok(mount_id)
}

/// Look up a mount by id, path (canonicalized when possible), or name.
pub fn find_mount(store: &MemoryStore, key: &str) -> Result<Option<MountRecord>> {
    if let Some(mount) = store.read_mount(key)? {
        return Ok(Some(mount));
    }
    // Retry with the canonical form of a filesystem path.
    let path = Path::new(key);
    if let Ok(canonical) = path.canonicalize() {
        return store.read_mount(&canonical.to_string_lossy());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory("unicode61 remove_diacritics 2").unwrap()
    }

    #[test]
    fn register_is_idempotent_on_canonical_path() {
        let mut store = test_store();
        let dir = tempfile::tempdir().unwrap();

        let first = register_mount(&mut store, dir.path(), Some("docs"), &[], None).unwrap();
        let second = register_mount(&mut store, dir.path(), None, &[], None).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_mounts().unwrap().len(), 1);
    }

    #[test]
    fn missing_path_is_validation_error() {
        let mut store = test_store();
        let err =
            register_mount(&mut store, Path::new("/nope/missing"), None, &[], None).unwrap_err();
        assert!(matches!(err, MemctlError::Validation(_)));
    }

    #[test]
    fn find_by_name_and_path() {
        let mut store = test_store();
        let dir = tempfile::tempdir().unwrap();
        let id = register_mount(&mut store, dir.path(), Some("corpus"), &[], None).unwrap();

        assert_eq!(find_mount(&store, "corpus").unwrap().unwrap().mount_id, id);
        assert_eq!(
            find_mount(&store, &dir.path().to_string_lossy())
                .unwrap()
                .unwrap()
                .mount_id,
            id
        );
        assert!(find_mount(&store, "absent").unwrap().is_none());
    }
}
