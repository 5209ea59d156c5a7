//! Terminal reporters: line, list, dot
//!
//! All three share the failure digest printed at the end of the run.

use std::io::Write;

use crate::config::RunConfig;
use crate::generate::TestPlan;
use crate::models::{Test, TestResult, TestStatus};

use super::{Reporter, RunSummary};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

fn status_symbol(status: TestStatus) -> String {
    match status {
        TestStatus::Passed => format!("{GREEN}✓{RESET}"),
        TestStatus::Failed => format!("{RED}✗{RESET}"),
        TestStatus::TimedOut => format!("{RED}⏱{RESET}"),
        TestStatus::Skipped => format!("{YELLOW}○{RESET}"),
    }
}

/// Numbered digest of every unexpected failure:
/// `1) file:line:column › full title` plus the recorded error.
pub(crate) fn format_failures(plan: &TestPlan) -> String {
    let mut out = String::new();
    let mut index = 0;
    for test in &plan.tests {
        if test.ok() {
            continue;
        }
        index += 1;
        out.push_str(&format!(
            "  {index}) {}:{}:{} › {}\n",
            test.file.display(),
            test.line,
            test.column,
            test.label()
        ));
        if let Some(result) = test.results.last() {
            if let Some(error) = &result.error {
                for line in error.message.lines() {
                    out.push_str(&format!("       {line}\n"));
                }
                if let Some(stack) = &error.stack {
                    for line in stack.lines().take(10) {
                        out.push_str(&format!("       {line}\n"));
                    }
                }
            }
        }
    }
    out
}

pub(crate) fn format_summary(summary: &RunSummary) -> String {
    let mut parts = Vec::new();
    if summary.unexpected > 0 {
        parts.push(format!("{RED}{} failed{RESET}", summary.unexpected));
    }
    if summary.flaky > 0 {
        parts.push(format!("{YELLOW}{} flaky{RESET}", summary.flaky));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }
    parts.push(format!("{GREEN}{} passed{RESET}", summary.expected));
    format!(
        "{} ({:.1}s)",
        parts.join(", "),
        summary.duration_ms as f64 / 1000.0
    )
}

/// One line per finished test, with run position.
pub struct LineReporter {
    quiet: bool,
    total: usize,
    done: usize,
}

impl LineReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            total: 0,
            done: 0,
        }
    }
}

impl Reporter for LineReporter {
    fn name(&self) -> &str {
        "line"
    }

    fn on_begin(&mut self, _config: &RunConfig, plan: &TestPlan) {
        self.total = plan.len();
        println!("Running {} test(s)", self.total);
    }

    fn on_stdout(&mut self, chunk: &str, _test: Option<&Test>) {
        if !self.quiet {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
    }

    fn on_stderr(&mut self, chunk: &str, _test: Option<&Test>) {
        if !self.quiet {
            eprint!("{chunk}");
        }
    }

    fn on_test_end(&mut self, test: &Test, result: &TestResult) {
        self.done += 1;
        println!(
            "[{}/{}] {} {} ({}ms)",
            self.done,
            self.total,
            status_symbol(result.status),
            test.label(),
            result.duration_ms
        );
    }

    fn on_timeout(&mut self, global_timeout_ms: u64) {
        println!("Global timeout of {global_timeout_ms}ms reached; aborting.");
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        let failures = format_failures(plan);
        if !failures.is_empty() {
            println!("\nFailures:\n{failures}");
        }
        println!("{}", format_summary(summary));
    }
}

/// One indented line per test, grouped under nothing fancier than order.
pub struct ListReporter {
    quiet: bool,
}

impl ListReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ListReporter {
    fn name(&self) -> &str {
        "list"
    }

    fn on_stdout(&mut self, chunk: &str, _test: Option<&Test>) {
        if !self.quiet {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
    }

    fn on_stderr(&mut self, chunk: &str, _test: Option<&Test>) {
        if !self.quiet {
            eprint!("{chunk}");
        }
    }

    fn on_test_end(&mut self, test: &Test, result: &TestResult) {
        let retry = if result.retry > 0 {
            format!(" (retry #{})", result.retry)
        } else {
            String::new()
        };
        println!(
            "  {} {}{retry} ({}ms)",
            status_symbol(result.status),
            test.label(),
            result.duration_ms
        );
    }

    fn on_timeout(&mut self, global_timeout_ms: u64) {
        println!("Global timeout of {global_timeout_ms}ms reached; aborting.");
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        let failures = format_failures(plan);
        if !failures.is_empty() {
            println!("\nFailures:\n{failures}");
        }
        println!("{}", format_summary(summary));
    }
}

/// The classic dot stream: `.` pass, `F` fail, `T` timeout, `s` skip.
pub struct DotReporter;

impl DotReporter {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for DotReporter {
    fn name(&self) -> &str {
        "dot"
    }

    fn on_test_end(&mut self, _test: &Test, result: &TestResult) {
        let dot = match result.status {
            TestStatus::Passed => ".",
            TestStatus::Failed => "F",
            TestStatus::TimedOut => "T",
            TestStatus::Skipped => "s",
        };
        print!("{dot}");
        let _ = std::io::stdout().flush();
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        println!();
        let failures = format_failures(plan);
        if !failures.is_empty() {
            println!("\nFailures:\n{failures}");
        }
        println!("{}", format_summary(summary));
    }
}
