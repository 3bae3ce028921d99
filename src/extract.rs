//! Text extraction: unified reader for text and binary document formats.
//!
//! Text and source files are read directly. Binary formats (Office, PDF)
//! dispatch to registered extractors — pure `bytes -> text` functions that
//! are external collaborators. A format without a registered extractor
//! surfaces a clear error naming the missing dependency; never a silent
//! skip.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{MemctlError, Result};

/// Extensions that need extraction rather than a plain read.
pub const BINARY_EXTS: &[&str] = &[".docx", ".odt", ".pptx", ".odp", ".xlsx", ".ods", ".pdf"];

/// All extensions considered ingestable (text + source code + binary).
pub const ALL_INGESTABLE_EXTS: &[&str] = &[
    // Text / markup
    ".md", ".txt", ".rst", ".csv", ".tsv", ".html", ".htm", ".xml", ".json", ".yaml", ".yml",
    ".toml",
    // Source code
    ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".go", ".rs", ".c", ".h", ".cpp", ".hpp",
    ".css", ".scss", ".less", ".sh", ".bash", ".zsh", ".sql", ".r", ".jl", ".lua", ".rb", ".php",
    ".swift", ".kt",
    // Binary (office / PDF)
    ".docx", ".odt", ".pptx", ".odp", ".xlsx", ".ods", ".pdf",
];

/// A pure bytes→text extractor for one binary format.
pub type Extractor = fn(&[u8]) -> Result<String>;

/// Registry mapping binary extensions to extractors. Built empty by
/// default: the formats are recognized, but extraction is delegated to
/// external tooling the deployment wires in.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Extractor>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ext: &str, extractor: Extractor) {
        self.extractors.insert(ext.to_lowercase(), extractor);
    }

    fn install_hint(ext: &str) -> &'static str {
        match ext {
            ".pdf" => "install poppler-utils (pdftotext)",
            ".docx" | ".odt" => "install a docx/odt extractor",
            ".pptx" | ".odp" => "install a pptx/odp extractor",
            ".xlsx" | ".ods" => "install a spreadsheet extractor",
            _ => "no extractor registered",
        }
    }

    /// Read any supported file and return its text content.
    pub fn read_file_text(&self, path: &Path) -> Result<String> {
        let ext = extension_of(path);

        if BINARY_EXTS.contains(&ext.as_str()) {
            let Some(extractor) = self.extractors.get(&ext) else {
                return Err(MemctlError::MissingExtractor {
                    ext: ext.clone(),
                    hint: Self::install_hint(&ext).into(),
                    path: path.to_path_buf(),
                });
            };
            let bytes = std::fs::read(path)?;
            return extractor(&bytes);
        }

        // Text file: direct read, lossy on invalid UTF-8.
        let bytes = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Lowercased extension including the dot, or empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// True when the extension is in the ingestable set.
pub fn is_ingestable(path: &Path) -> bool {
    ALL_INGESTABLE_EXTS.contains(&extension_of(path).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_files_read_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "# Title\n\nbody").unwrap();
        let registry = ExtractorRegistry::new();
        assert_eq!(registry.read_file_text(&path).unwrap(), "# Title\n\nbody");
    }

    #[test]
    fn missing_extractor_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.4 fake").unwrap();
        let registry = ExtractorRegistry::new();
        let err = registry.read_file_text(&path).unwrap_err();
        match err {
            MemctlError::MissingExtractor { ext, hint, .. } => {
                assert_eq!(ext, ".pdf");
                assert!(hint.contains("poppler"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn registered_extractor_is_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.pptx");
        std::fs::write(&path, b"binary-bytes").unwrap();

        let mut registry = ExtractorRegistry::new();
        registry.register(".pptx", |bytes| Ok(format!("extracted {} bytes", bytes.len())));
        assert_eq!(
            registry.read_file_text(&path).unwrap(),
            "extracted 12 bytes"
        );
    }

    #[test]
    fn ingestable_extension_checks() {
        assert!(is_ingestable(Path::new("a/b/readme.md")));
        assert!(is_ingestable(Path::new("src/main.rs")));
        assert!(is_ingestable(Path::new("doc.PDF")));
        assert!(!is_ingestable(Path::new("binary.exe")));
        assert!(!is_ingestable(Path::new("no_extension")));
    }
}
