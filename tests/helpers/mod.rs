#![allow(dead_code)]

use memctl::config::PolicyConfig;
use memctl::extract::ExtractorRegistry;
use memctl::memory::store::MemoryStore;
use memctl::memory::types::MemoryItem;
use memctl::policy::MemoryPolicy;

pub const FR_TOKENIZER: &str = "unicode61 remove_diacritics 2";

/// Fresh in-memory store with the default (French) tokenizer.
pub fn test_store() -> MemoryStore {
    MemoryStore::open_in_memory(FR_TOKENIZER).unwrap()
}

/// Default policy engine.
pub fn test_policy() -> MemoryPolicy {
    MemoryPolicy::new(PolicyConfig::default())
}

/// Empty extractor registry (text files only).
pub fn test_extractors() -> ExtractorRegistry {
    ExtractorRegistry::new()
}

/// Write a simple item with provenance; returns its id.
pub fn seed_item(store: &mut MemoryStore, title: &str, content: &str) -> String {
    let mut item = MemoryItem::new(title, content);
    item.provenance.source_id = "test-fixture".into();
    store.write_item(&mut item, "create").unwrap();
    item.id
}

/// Build a small markdown corpus on disk; returns the directory.
pub fn markdown_corpus(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}
