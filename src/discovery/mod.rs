//! Test file discovery
//!
//! A gitignore-aware recursive walk of the test directory, followed by the
//! match/ignore glob filters and the positional name filters. Fixture files
//! are reported separately so they can be loaded strictly before test files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::debug;

use crate::config::RunConfig;

/// Files selected for a run, in sorted path order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredFiles {
    /// Loaded before any test file.
    pub fixture_files: Vec<PathBuf>,
    pub test_files: Vec<PathBuf>,
}

impl DiscoveredFiles {
    pub fn is_empty(&self) -> bool {
        self.test_files.is_empty()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob {pattern:?}"))?);
    }
    builder.build().context("failed to build glob set")
}

/// Walk `config.test_dir` and partition matching files. Returned paths are
/// relative to the test directory.
pub fn discover(config: &RunConfig) -> Result<DiscoveredFiles> {
    let test_match = build_globset(&config.test_match)?;
    let test_ignore = build_globset(&config.test_ignore)?;
    let fixture_match = build_globset(&config.fixture_match)?;
    let fixture_ignore = build_globset(&config.fixture_ignore)?;

    let mut found = DiscoveredFiles::default();

    let walk = WalkBuilder::new(&config.test_dir)
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .build();

    for entry in walk {
        let entry = entry.context("walk failed")?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&config.test_dir) else {
            continue;
        };
        let relative = relative.to_path_buf();

        if fixture_match.is_match(&relative) && !fixture_ignore.is_match(&relative) {
            found.fixture_files.push(relative);
        } else if test_match.is_match(&relative)
            && !test_ignore.is_match(&relative)
            && matches_name_filters(&relative, &config.name_filters)
        {
            found.test_files.push(relative);
        }
    }

    found.fixture_files.sort();
    found.test_files.sort();
    debug!(
        "discovered {} test file(s), {} fixture file(s)",
        found.test_files.len(),
        found.fixture_files.len()
    );
    Ok(found)
}

fn matches_name_filters(path: &Path, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let haystack = path.to_string_lossy();
    filters.iter().any(|f| haystack.contains(f.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn config_for(dir: &Path) -> RunConfig {
        RunConfig {
            test_dir: dir.to_path_buf(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn finds_spec_and_test_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.spec.rs", "");
        write(dir.path(), "a.test.rs", "");
        write(dir.path(), "notes.md", "");

        let found = discover(&config_for(dir.path())).unwrap();
        assert_eq!(
            found.test_files,
            vec![PathBuf::from("a.test.rs"), PathBuf::from("b.spec.rs")]
        );
    }

    #[test]
    fn separates_fixture_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "env.fixture.rs", "");
        write(dir.path(), "a.spec.rs", "");

        let found = discover(&config_for(dir.path())).unwrap();
        assert_eq!(found.fixture_files, vec![PathBuf::from("env.fixture.rs")]);
        assert_eq!(found.test_files, vec![PathBuf::from("a.spec.rs")]);
    }

    #[test]
    fn respects_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".gitignore", "generated/\n");
        write(dir.path(), "generated/skip.spec.rs", "");
        write(dir.path(), "keep.spec.rs", "");

        let found = discover(&config_for(dir.path())).unwrap();
        assert_eq!(found.test_files, vec![PathBuf::from("keep.spec.rs")]);
    }

    #[test]
    fn test_ignore_glob_wins_over_match() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "slow/big.spec.rs", "");
        write(dir.path(), "fast/small.spec.rs", "");

        let mut config = config_for(dir.path());
        config.test_ignore = vec!["slow/**".into()];
        let found = discover(&config).unwrap();
        assert_eq!(found.test_files, vec![PathBuf::from("fast/small.spec.rs")]);
    }

    #[test]
    fn name_filters_select_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "auth/login.spec.rs", "");
        write(dir.path(), "cart/checkout.spec.rs", "");

        let mut config = config_for(dir.path());
        config.name_filters = vec!["login".into()];
        let found = discover(&config).unwrap();
        assert_eq!(found.test_files, vec![PathBuf::from("auth/login.spec.rs")]);
    }
}
