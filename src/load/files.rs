//! File registry
//!
//! Test files are real files on disk whose registration bodies are native
//! callbacks linked into the binary, keyed by relative path. Workers re-run
//! the same callbacks, so parent and children observe identical spec trees.

use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::loader::TestApi;

/// Whether a registered file is a test file or a fixture file. Fixture files
/// load strictly before test files and are the only place `run_with` is
/// allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Test,
    Fixture,
}

pub type RegistrationFn = Arc<dyn Fn(&TestApi) + Send + Sync>;

pub struct FileEntry {
    pub path: PathBuf,
    pub kind: FileKind,
    pub callback: RegistrationFn,
    /// Source file of the `add` call; hooks registered from any other source
    /// file are rejected.
    pub source: &'static str,
}

/// All files known to this binary, in registration order.
#[derive(Default)]
pub struct FileRegistry {
    entries: Vec<FileEntry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub fn add(&mut self, path: impl Into<PathBuf>, callback: impl Fn(&TestApi) + Send + Sync + 'static) {
        self.push(path.into(), FileKind::Test, Arc::new(callback), Location::caller().file());
    }

    #[track_caller]
    pub fn add_fixture(
        &mut self,
        path: impl Into<PathBuf>,
        callback: impl Fn(&TestApi) + Send + Sync + 'static,
    ) {
        self.push(path.into(), FileKind::Fixture, Arc::new(callback), Location::caller().file());
    }

    fn push(&mut self, path: PathBuf, kind: FileKind, callback: RegistrationFn, source: &'static str) {
        self.entries.push(FileEntry {
            path,
            kind,
            callback,
            source,
        });
    }

    pub fn get(&self, path: &Path) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn paths(&self, kind: FileKind) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.path.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_path() {
        let mut registry = FileRegistry::new();
        registry.add("a.spec.rs", |_t| {});
        registry.add_fixture("fixtures.rs", |_t| {});

        assert!(registry.get(Path::new("a.spec.rs")).is_some());
        assert!(registry.get(Path::new("missing.spec.rs")).is_none());
        assert_eq!(registry.paths(FileKind::Test), vec![PathBuf::from("a.spec.rs")]);
        assert_eq!(registry.paths(FileKind::Fixture), vec![PathBuf::from("fixtures.rs")]);
    }

    #[test]
    fn registration_source_is_this_file() {
        let mut registry = FileRegistry::new();
        registry.add("a.spec.rs", |_t| {});
        let entry = registry.get(Path::new("a.spec.rs")).unwrap();
        assert!(entry.source.ends_with("files.rs"));
    }
}
