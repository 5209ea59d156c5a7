//! specrun - a parallel spec runner
//!
//! Test files declaratively register specs, suites, hooks, and environment
//! fixtures; the runner discovers those files, expands each spec into
//! concrete test instances across repetitions, retries, and environment
//! variations, dispatches them to a pool of worker processes, and streams
//! progress to pluggable reporters.
//!
//! Test files are real files on disk whose registration bodies are native
//! callbacks linked into the embedding binary:
//!
//! ```no_run
//! use specrun::{run_cli, FileRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = FileRegistry::new();
//!     registry.add("math.spec.rs", |t| {
//!         t.describe("addition", |t| {
//!             t.test("adds small numbers", |_cx| async {
//!                 anyhow::ensure!(1 + 1 == 2);
//!                 Ok(())
//!             });
//!         });
//!     });
//!     std::process::exit(run_cli(registry).await);
//! }
//! ```
//!
//! Workers are re-executions of the same binary (selected by the
//! `SPECRUN_WORKER` environment variable), so every worker links the same
//! registration callbacks and rebuilds an identical spec tree.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod generate;
pub mod load;
pub mod models;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod utils;
pub mod worker;

pub use config::{GrepFilter, RunConfig, Shard};
pub use load::{Env, FileRegistry, RunWithOptions, TestApi};
pub use models::{StateBag, TestArgs, TestInfo};
pub use report::{Multiplexer, Reporter, RunSummary};
pub use runner::{run_cli, RunStatus, Runner};
