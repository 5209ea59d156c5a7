//! Runner façade
//!
//! Drives the load, generate, run pipeline and maps the outcome to an exit
//! disposition. Worker-mode processes short-circuit into the worker loop
//! before any of this runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use crate::cli::Args;
use crate::config::RunConfig;
use crate::discovery::discover;
use crate::dispatch;
use crate::generate::{generate, LoadedFile, TestPlan};
use crate::load::{FileRegistry, Loader};
use crate::report::{Multiplexer, RunSummary};
use crate::utils::{init_logger, Timer};
use crate::worker;

/// Final disposition of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
    /// Interrupted by SIGINT.
    Sigint,
    /// Focus marks exist while `--forbid-only` is set.
    ForbidOnly,
    /// The filtered plan came out empty.
    NoTests,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::Failed | RunStatus::ForbidOnly | RunStatus::NoTests => 1,
            RunStatus::Sigint => 130,
        }
    }
}

/// Loads registered files, expands the plan, and runs it on the worker pool.
pub struct Runner {
    registry: FileRegistry,
    config: RunConfig,
}

impl Runner {
    pub fn new(registry: FileRegistry, config: RunConfig) -> Self {
        Self { registry, config }
    }

    /// Discover and load files, returning the generated plan along with the
    /// fixture files workers must load first.
    fn build_plan(&self) -> Result<Option<(TestPlan, Vec<PathBuf>)>> {
        let discovered = discover(&self.config)?;

        let loader = Arc::new(Loader::new());
        for path in &discovered.fixture_files {
            let entry = self
                .registry
                .get(path)
                .with_context(|| format!("no registered loader for fixture {}", path.display()))?;
            loader
                .load_file(entry)
                .with_context(|| format!("failed to load fixture {}", path.display()))?;
        }

        let mut files = Vec::new();
        for path in &discovered.test_files {
            let root = match self.registry.get(path) {
                Some(entry) => loader.load_file(entry).map_err(|e| e.to_string()),
                None => Err(format!("no registered loader for {}", path.display())),
            };
            if let Err(message) = &root {
                debug!("load failed for {}: {message}", path.display());
            }
            files.push(LoadedFile {
                path: path.clone(),
                root,
            });
        }

        let plan = match loader
            .with_tree(|arena, factories| generate(arena, factories, &self.config, &files))
        {
            Ok(plan) => plan,
            Err(_forbidden) => return Ok(None),
        };
        Ok(Some((plan, discovered.fixture_files)))
    }

    /// Generate the plan and dump it without running.
    pub fn list(&self) -> Result<RunStatus> {
        let Some((plan, _)) = self.build_plan()? else {
            return Ok(RunStatus::ForbidOnly);
        };
        if plan.is_empty() {
            println!("No tests found");
            return Ok(RunStatus::NoTests);
        }
        println!("Listing {} test(s):", plan.len());
        for test in &plan.tests {
            println!(
                "  {}:{}:{} › {}",
                test.file.display(),
                test.line,
                test.column,
                test.label()
            );
        }
        Ok(RunStatus::Passed)
    }

    pub async fn run(&self) -> Result<RunStatus> {
        let Some((mut plan, fixture_files)) = self.build_plan()? else {
            return Ok(RunStatus::ForbidOnly);
        };
        if plan.is_empty() {
            info!("no tests matched the current filters");
            return Ok(RunStatus::NoTests);
        }

        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                self.config.output_dir.display()
            )
        })?;

        let mut reporters = Multiplexer::from_names(&self.config.reporters, &self.config)?;
        reporters.on_begin(&self.config, &plan);

        let timer = Timer::start();
        let outcome =
            dispatch::run_tests(&self.config, &mut plan, &fixture_files, &mut reporters).await?;
        let summary = RunSummary::from_plan(&plan, timer.elapsed_ms(), outcome.interrupted);
        reporters.on_end(&plan, &summary);

        if outcome.interrupted {
            return Ok(RunStatus::Sigint);
        }
        if outcome.hit_global_timeout || summary.unexpected > 0 || outcome.failures > 0 {
            return Ok(RunStatus::Failed);
        }
        Ok(RunStatus::Passed)
    }
}

/// Binary entry point shared by the `specrun` CLI and embedding binaries.
/// Returns the process exit code.
pub async fn run_cli(registry: FileRegistry) -> i32 {
    if worker::is_worker_process() {
        return match worker::worker_main(registry).await {
            Ok(code) => code,
            Err(error) => {
                eprintln!("worker failed: {error:#}");
                1
            }
        };
    }

    let args = Args::parse();
    init_logger(args.verbose);

    let config = match args.resolve() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("specrun: {error:#}");
            return 1;
        }
    };

    let runner = Runner::new(registry, config);
    let result = if args.list { runner.list() } else { runner.run().await };
    match result {
        Ok(status) => {
            debug!("run finished: {status:?}");
            status.exit_code()
        }
        Err(error) => {
            eprintln!("specrun: {error:#}");
            1
        }
    }
}
