//! Run configuration
//!
//! Resolution order: built-in defaults, then an optional YAML/JSON config
//! file, then command-line flags. The resolved [`RunConfig`] is also the
//! snapshot serialized to every worker at init.

mod filters;

pub use filters::{CompiledGrep, GrepFilter, Shard};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Config file locations probed in order when `--config` is not given.
const CONFIG_LOCATIONS: &[&str] = &["specrun.yaml", "specrun.yml", "specrun.json"];

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_OUTPUT_DIR: &str = "test-results";
pub const DEFAULT_SNAPSHOT_DIR: &str = "__snapshots__";

/// Fully resolved run configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    pub test_dir: PathBuf,
    /// Per-test default budget in milliseconds.
    pub timeout_ms: u64,
    /// Whole-run deadline in milliseconds; 0 disables it.
    pub global_timeout_ms: u64,
    /// Worker pool size.
    pub workers: usize,
    pub retries: u32,
    pub repeat_each: u32,
    /// Stop after this many failures; 0 means unlimited.
    pub max_failures: u32,
    pub forbid_only: bool,
    pub quiet: bool,
    pub update_snapshots: bool,
    pub output_dir: PathBuf,
    /// Relative to `test_dir`.
    pub snapshot_dir: PathBuf,
    pub grep: Option<GrepFilter>,
    pub shard: Option<Shard>,
    pub test_match: Vec<String>,
    pub test_ignore: Vec<String>,
    pub fixture_match: Vec<String>,
    pub fixture_ignore: Vec<String>,
    /// Positional substring filters on file paths.
    pub name_filters: Vec<String>,
    pub reporters: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("."),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            global_timeout_ms: 0,
            workers: default_workers(),
            retries: 0,
            repeat_each: 1,
            max_failures: 0,
            forbid_only: false,
            quiet: false,
            update_snapshots: false,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            grep: None,
            shard: None,
            test_match: vec!["**/*.spec.*".into(), "**/*.test.*".into()],
            test_ignore: Vec::new(),
            fixture_match: vec!["**/*.fixture.*".into()],
            fixture_ignore: Vec::new(),
            name_filters: Vec::new(),
            reporters: vec!["line".into()],
        }
    }
}

/// Pool default: half the cores, at least one.
pub fn default_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

impl RunConfig {
    /// Apply a config file underneath the current values: only fields the
    /// file sets are taken. CLI flags are applied afterwards by the caller.
    pub fn apply_file(&mut self, file: FileConfig) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = file.$field {
                    self.$field = value;
                }
            };
        }
        take!(timeout_ms);
        take!(global_timeout_ms);
        take!(workers);
        take!(retries);
        take!(repeat_each);
        take!(max_failures);
        take!(forbid_only);
        take!(quiet);
        take!(output_dir);
        take!(snapshot_dir);
        take!(test_match);
        take!(test_ignore);
        take!(fixture_match);
        take!(fixture_ignore);
        take!(reporters);
        if let Some(grep) = file.grep {
            self.grep = Some(GrepFilter::parse(&grep));
        }
        if let Some(shard) = file.shard {
            self.shard = shard.parse().ok();
        }
    }

    /// Artifact root for one test, partitioned so retries and variants never
    /// collide: `output_dir/<relative-file-minus-suffix>/<slug(title)>/<tag>`.
    pub fn artifact_dir(&self, file: &Path, full_title: &str, variant_tag: &str) -> PathBuf {
        let relative = file.to_string_lossy();
        let relative = relative
            .strip_suffix(".spec.rs")
            .or_else(|| relative.strip_suffix(".test.rs"))
            .unwrap_or(&relative);
        let mut dir = self
            .output_dir
            .join(relative)
            .join(crate::utils::slug(full_title));
        if !variant_tag.is_empty() {
            dir = dir.join(crate::utils::slug(variant_tag));
        }
        dir
    }

    /// Snapshot root, resolved against the test directory.
    pub fn snapshot_root(&self) -> PathBuf {
        self.test_dir.join(&self.snapshot_dir)
    }
}

/// Shape of the optional `specrun.yaml` / `specrun.json` file. Every field is
/// optional; unset fields fall through to the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub timeout_ms: Option<u64>,
    pub global_timeout_ms: Option<u64>,
    pub workers: Option<usize>,
    pub retries: Option<u32>,
    pub repeat_each: Option<u32>,
    pub max_failures: Option<u32>,
    pub forbid_only: Option<bool>,
    pub quiet: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    pub grep: Option<String>,
    pub shard: Option<String>,
    pub test_match: Option<Vec<String>>,
    pub test_ignore: Option<Vec<String>>,
    pub fixture_match: Option<Vec<String>>,
    pub fixture_ignore: Option<Vec<String>>,
    pub reporters: Option<Vec<String>>,
}

impl FileConfig {
    /// Probe the standard locations for a config file.
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Deserialize a run config file, picking the format from its extension
    /// (`.yaml`/`.yml` are YAML, anything else JSON).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read run config {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let parsed: Result<Self> = if is_yaml {
            serde_yaml::from_str(&raw).map_err(anyhow::Error::from)
        } else {
            serde_json::from_str(&raw).map_err(anyhow::Error::from)
        };
        parsed.with_context(|| format!("{} is not a valid run config", path.display()))
    }
}
