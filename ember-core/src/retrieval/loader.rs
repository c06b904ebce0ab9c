//! Directory ingestion

use std::path::Path;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use super::Document;
use crate::error::{EngineError, Result};

/// File extensions picked up by [`directory_loader`]
pub const ALLOWED_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "xml"];

/// Load every allow-listed file under `directory`, recursively.
///
/// Files that are unsupported, hidden or unreadable (including non-UTF-8 content) are
/// skipped. Documents come back in path order with `{"source": <path>}` metadata.
pub fn directory_loader(directory: &Path) -> Result<Vec<Document>> {
    if !directory.is_dir() {
        return Err(EngineError::DirectoryNotFound(directory.display().to_string()));
    }

    let mut documents = Vec::new();
    let walker = WalkDir::new(directory)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_allowed(entry.path()) {
            continue;
        }

        match std::fs::read_to_string(entry.path()) {
            Ok(content) => documents.push(Document::from_file(content, entry.path())),
            Err(e) => debug!("Skipping {}: {e}", entry.path().display()),
        }
    }

    info!("Loaded {} documents from {}", documents.len(), directory.display());
    Ok(documents)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_allowed(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.iter().any(|allowed| ext.eq_ignore_ascii_case(allowed)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_loads_allowed_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::write(dir.path().join("b.MD"), "beta").unwrap();
        fs::write(dir.path().join("c.rs"), "fn main() {}").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("d.json"), "{}").unwrap();
        fs::write(dir.path().join(".hidden.txt"), "secret").unwrap();

        let docs = directory_loader(dir.path()).unwrap();
        let contents: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["alpha", "beta", "{}"]);

        let source = docs[0].metadata["source"].as_str().unwrap();
        assert!(source.ends_with("a.txt"));
    }

    #[test]
    fn test_skips_non_utf8_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.txt"), [0xff, 0xfe, 0x00, 0xc3]).unwrap();
        fs::write(dir.path().join("good.txt"), "fine").unwrap();

        let docs = directory_loader(dir.path()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "fine");
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(directory_loader(&missing), Err(EngineError::DirectoryNotFound(_))));
    }
}
