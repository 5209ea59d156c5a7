//! CLI argument parsing
//!
//! Defines the command-line interface using clap.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{FileConfig, GrepFilter, RunConfig};

/// Parallel spec runner
#[derive(Parser, Debug)]
#[command(name = "specrun")]
#[command(version)]
#[command(about = "Discover spec files, run them across worker processes, report results")]
#[command(long_about = None)]
pub struct Args {
    /// Optional test directory followed by path substring filters
    #[arg(value_name = "DIR|FILTER")]
    pub paths: Vec<String>,

    /// Abort with exit 1 if any focus mark exists
    #[arg(long)]
    pub forbid_only: bool,

    /// Filter by spec full title; /pattern/flags is treated as a regex
    #[arg(short, long, value_name = "PATTERN")]
    pub grep: Option<String>,

    /// Whole-run deadline in milliseconds; 0 = none
    #[arg(long, value_name = "MS")]
    pub global_timeout: Option<u64>,

    /// Worker pool size
    #[arg(short = 'j', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Generate the plan and dump it; do not run
    #[arg(long)]
    pub list: bool,

    /// Stop after N failures
    #[arg(long, value_name = "N")]
    pub max_failures: Option<u32>,

    /// Stop after the first failure (same as --max-failures 1)
    #[arg(short = 'x')]
    pub fail_fast: bool,

    /// Per-test artifact root
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Suppress worker stdio passthrough
    #[arg(long)]
    pub quiet: bool,

    /// Multiplicity per spec
    #[arg(long, value_name = "N")]
    pub repeat_each: Option<u32>,

    /// Comma-separated reporter names
    #[arg(long, value_name = "LIST")]
    pub reporter: Option<String>,

    /// Max retry count on failure
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// 1-based shard selector, e.g. 2/3
    #[arg(long, value_name = "CURRENT/TOTAL")]
    pub shard: Option<String>,

    /// Snapshot root relative to the test directory
    #[arg(long, value_name = "DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Test file discovery glob (repeatable)
    #[arg(long = "test-match", value_name = "GLOB")]
    pub test_match: Vec<String>,

    /// Test file ignore glob (repeatable)
    #[arg(long = "test-ignore", value_name = "GLOB")]
    pub test_ignore: Vec<String>,

    /// Fixture file glob; fixtures load before tests (repeatable)
    #[arg(long = "fixture-match", value_name = "GLOB")]
    pub fixture_match: Vec<String>,

    /// Fixture file ignore glob (repeatable)
    #[arg(long = "fixture-ignore", value_name = "GLOB")]
    pub fixture_ignore: Vec<String>,

    /// Per-test default timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Rewrite snapshots on mismatch
    #[arg(short = 'u', long)]
    pub update_snapshots: bool,

    /// Enable verbose diagnostics
    #[arg(short, long)]
    pub verbose: bool,

    /// Explicit config file path
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Resolve defaults < config file < CLI flags into one [`RunConfig`].
    pub fn resolve(&self) -> Result<RunConfig> {
        let mut config = RunConfig::default();

        let file = match &self.config {
            Some(path) => Some(FileConfig::load(path)?),
            None => match FileConfig::find() {
                Some(path) => Some(FileConfig::load(&path)?),
                None => None,
            },
        };
        if let Some(file) = file {
            config.apply_file(file);
        }

        // First positional names the test directory when it exists on disk;
        // everything else is a path substring filter.
        let mut paths = self.paths.iter();
        if let Some(first) = self.paths.first() {
            if PathBuf::from(first).is_dir() {
                config.test_dir = PathBuf::from(first);
                paths.next();
            }
        }
        config.name_filters.extend(paths.cloned());

        if self.forbid_only {
            config.forbid_only = true;
        }
        if let Some(grep) = &self.grep {
            let filter = GrepFilter::parse(grep);
            filter.compile().context("invalid --grep pattern")?;
            config.grep = Some(filter);
        }
        if let Some(ms) = self.global_timeout {
            config.global_timeout_ms = ms;
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(n) = self.max_failures {
            config.max_failures = n;
        }
        if self.fail_fast {
            config.max_failures = 1;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if self.quiet {
            config.quiet = true;
        }
        if let Some(n) = self.repeat_each {
            config.repeat_each = n.max(1);
        }
        if let Some(list) = &self.reporter {
            config.reporters = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(n) = self.retries {
            config.retries = n;
        }
        if let Some(shard) = &self.shard {
            config.shard = Some(shard.parse().context("invalid --shard")?);
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir = dir.clone();
        }
        if !self.test_match.is_empty() {
            config.test_match = self.test_match.clone();
        }
        if !self.test_ignore.is_empty() {
            config.test_ignore = self.test_ignore.clone();
        }
        if !self.fixture_match.is_empty() {
            config.fixture_match = self.fixture_match.clone();
        }
        if !self.fixture_ignore.is_empty() {
            config.fixture_ignore = self.fixture_ignore.clone();
        }
        if let Some(ms) = self.timeout {
            config.timeout_ms = ms;
        }
        if self.update_snapshots {
            config.update_snapshots = true;
        }

        Ok(config)
    }
}
