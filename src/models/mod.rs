//! Data models for the spec runner
//!
//! This module contains the spec tree (suites, specs, hooks), the expanded
//! test entities with their run results, and the per-test runtime handle.

mod info;
mod suite;

pub use info::{
    merge_bag, HookArgs, HookBody, HookFuture, StateBag, TestArgs, TestBody, TestFuture, TestInfo,
    WorkerInfo,
};
pub use suite::{Hook, HookKind, SourceLocation, Spec, SpecId, Suite, SuiteArena, SuiteId};
pub use test::{Annotation, Test, TestError, TestId, TestOutcome, TestResult, TestStatus};
