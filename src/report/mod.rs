//! Reporters
//!
//! Run progress is streamed to every configured reporter in registration
//! order. A reporter that panics is logged and skipped; a bad reporter must
//! never corrupt the run.

mod json;
mod junit;
mod text;

pub use json::JsonReporter;
pub use junit::JunitReporter;
pub use text::{DotReporter, LineReporter, ListReporter};

use std::panic::AssertUnwindSafe;

use anyhow::{bail, Result};

use crate::config::RunConfig;
use crate::generate::TestPlan;
use crate::models::{Test, TestOutcome, TestResult};

/// Aggregate counts shown at the end of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub expected: usize,
    pub unexpected: usize,
    pub flaky: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn from_plan(plan: &TestPlan, duration_ms: u64, interrupted: bool) -> Self {
        let mut summary = RunSummary {
            total: plan.len(),
            duration_ms,
            interrupted,
            ..RunSummary::default()
        };
        for test in &plan.tests {
            match test.outcome() {
                TestOutcome::Expected => summary.expected += 1,
                TestOutcome::Unexpected => summary.unexpected += 1,
                TestOutcome::Flaky => summary.flaky += 1,
                TestOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn ok(&self) -> bool {
        self.unexpected == 0 && !self.interrupted
    }
}

/// Lifecycle sink. All methods default to no-ops so reporters implement only
/// what they render.
pub trait Reporter: Send {
    fn name(&self) -> &str;

    fn on_begin(&mut self, config: &RunConfig, plan: &TestPlan) {
        let _ = (config, plan);
    }

    fn on_test_begin(&mut self, test: &Test) {
        let _ = test;
    }

    fn on_stdout(&mut self, chunk: &str, test: Option<&Test>) {
        let _ = (chunk, test);
    }

    fn on_stderr(&mut self, chunk: &str, test: Option<&Test>) {
        let _ = (chunk, test);
    }

    fn on_test_end(&mut self, test: &Test, result: &TestResult) {
        let _ = (test, result);
    }

    fn on_timeout(&mut self, global_timeout_ms: u64) {
        let _ = global_timeout_ms;
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        let _ = (plan, summary);
    }
}

/// Fan-out of lifecycle events to every reporter, isolating their failures.
#[derive(Default)]
pub struct Multiplexer {
    reporters: Vec<Box<dyn Reporter>>,
}

impl Multiplexer {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    /// Build the reporter set from `--reporter` names.
    pub fn from_names(names: &[String], config: &RunConfig) -> Result<Self> {
        let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
        for name in names {
            match name.as_str() {
                "line" => reporters.push(Box::new(LineReporter::new(config.quiet))),
                "list" => reporters.push(Box::new(ListReporter::new(config.quiet))),
                "dot" => reporters.push(Box::new(DotReporter::new())),
                "json" => reporters.push(Box::new(JsonReporter::from_env())),
                "junit" => reporters.push(Box::new(JunitReporter::from_env())),
                "null" => {}
                other => bail!("unknown reporter {other:?}"),
            }
        }
        Ok(Self::new(reporters))
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    fn each(&mut self, mut call: impl FnMut(&mut dyn Reporter)) {
        for reporter in &mut self.reporters {
            let name = reporter.name().to_string();
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| call(reporter.as_mut())));
            if outcome.is_err() {
                eprintln!("reporter {name:?} failed; continuing without it for this event");
            }
        }
    }

    pub fn on_begin(&mut self, config: &RunConfig, plan: &TestPlan) {
        self.each(|r| r.on_begin(config, plan));
    }

    pub fn on_test_begin(&mut self, test: &Test) {
        self.each(|r| r.on_test_begin(test));
    }

    pub fn on_stdout(&mut self, chunk: &str, test: Option<&Test>) {
        self.each(|r| r.on_stdout(chunk, test));
    }

    pub fn on_stderr(&mut self, chunk: &str, test: Option<&Test>) {
        self.each(|r| r.on_stderr(chunk, test));
    }

    pub fn on_test_end(&mut self, test: &Test, result: &TestResult) {
        self.each(|r| r.on_test_end(test, result));
    }

    pub fn on_timeout(&mut self, global_timeout_ms: u64) {
        self.each(|r| r.on_timeout(global_timeout_ms));
    }

    pub fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        self.each(|r| r.on_end(plan, summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct PanickyReporter;

    impl Reporter for PanickyReporter {
        fn name(&self) -> &str {
            "panicky"
        }

        fn on_timeout(&mut self, _global_timeout_ms: u64) {
            panic!("reporter bug");
        }
    }

    struct CountingReporter {
        timeouts: Arc<Mutex<u32>>,
    }

    impl Reporter for CountingReporter {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_timeout(&mut self, _global_timeout_ms: u64) {
            *self.timeouts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn panicking_reporter_does_not_stop_later_ones() {
        let timeouts = Arc::new(Mutex::new(0));
        let mut mux = Multiplexer::new(vec![
            Box::new(PanickyReporter),
            Box::new(CountingReporter {
                timeouts: timeouts.clone(),
            }),
        ]);
        mux.on_timeout(1000);
        mux.on_timeout(1000);
        assert_eq!(*timeouts.lock().unwrap(), 2);
    }

    #[test]
    fn from_names_rejects_unknown() {
        let config = RunConfig::default();
        assert!(Multiplexer::from_names(&["nope".into()], &config).is_err());
        let mux =
            Multiplexer::from_names(&["line".into(), "dot".into(), "null".into()], &config)
                .unwrap();
        assert_eq!(mux.len(), 2);
    }
}
