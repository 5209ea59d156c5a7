//! JUnit XML report
//!
//! One `<testsuite>` per test file under a `<testsuites>` root whose
//! attributes aggregate the children. Failures embed the formatted error as
//! CDATA; captured output becomes `<system-out>`/`<system-err>`.

use std::fmt::Write as _;
use std::path::PathBuf;

use regex::Regex;
use tracing::warn;

use crate::generate::TestPlan;
use crate::models::{Test, TestOutcome};

use super::{Reporter, RunSummary};

pub struct JunitReporter {
    output: Option<PathBuf>,
    strip_ansi: bool,
}

impl JunitReporter {
    pub fn new(output: Option<PathBuf>, strip_ansi: bool) -> Self {
        Self { output, strip_ansi }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("SPECRUN_JUNIT_OUTPUT_NAME").map(PathBuf::from),
            std::env::var_os("SPECRUN_JUNIT_STRIP_ANSI").is_some(),
        )
    }

    fn clean(&self, text: &str) -> String {
        let text = if self.strip_ansi {
            strip_ansi(text)
        } else {
            text.to_string()
        };
        strip_forbidden_controls(&text)
    }

    fn render(&self, plan: &TestPlan, summary: &RunSummary) -> String {
        // Group tests per file, in plan order.
        let mut files: Vec<(String, Vec<&Test>)> = Vec::new();
        for test in &plan.tests {
            let name = test.file.display().to_string();
            match files.last_mut() {
                Some((current, bucket)) if *current == name => bucket.push(test),
                _ => files.push((name, vec![test])),
            }
        }

        let total_failures = plan
            .tests
            .iter()
            .filter(|t| !t.ok() && t.outcome() != TestOutcome::Skipped)
            .count();
        let total_skipped = plan
            .tests
            .iter()
            .filter(|t| t.outcome() == TestOutcome::Skipped)
            .count();

        let mut out = String::new();
        let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        let _ = writeln!(
            out,
            r#"<testsuites tests="{}" failures="{total_failures}" skipped="{total_skipped}" errors="0" time="{:.3}">"#,
            plan.len(),
            summary.duration_ms as f64 / 1000.0
        );

        for (file, tests) in &files {
            let failures = tests
                .iter()
                .filter(|t| !t.ok() && t.outcome() != TestOutcome::Skipped)
                .count();
            let skipped = tests
                .iter()
                .filter(|t| t.outcome() == TestOutcome::Skipped)
                .count();
            let time: u64 = tests
                .iter()
                .filter_map(|t| t.results.last())
                .map(|r| r.duration_ms)
                .sum();
            let _ = writeln!(
                out,
                r#"  <testsuite name="{}" tests="{}" failures="{failures}" skipped="{skipped}" errors="0" time="{:.3}">"#,
                xml_escape(&self.clean(file)),
                tests.len(),
                time as f64 / 1000.0
            );

            for test in tests {
                let duration = test
                    .results
                    .last()
                    .map(|r| r.duration_ms)
                    .unwrap_or_default();
                let _ = write!(
                    out,
                    r#"    <testcase name="{}" classname="{}" time="{:.3}">"#,
                    xml_escape(&self.clean(&test.label())),
                    xml_escape(&self.clean(file)),
                    duration as f64 / 1000.0
                );
                out.push('\n');

                if test.outcome() == TestOutcome::Skipped {
                    out.push_str("      <skipped/>\n");
                } else if !test.ok() {
                    let message = test
                        .results
                        .last()
                        .and_then(|r| r.error.as_ref())
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "test failed".into());
                    let body = test
                        .results
                        .last()
                        .and_then(|r| r.error.as_ref())
                        .map(|e| match &e.stack {
                            Some(stack) => format!("{}\n{stack}", e.message),
                            None => e.message.clone(),
                        })
                        .unwrap_or_default();
                    let _ = writeln!(
                        out,
                        r#"      <failure message="{}" type="FAILURE"><![CDATA[{}]]></failure>"#,
                        xml_escape(&self.clean(&message)),
                        cdata_safe(&self.clean(&body))
                    );
                }

                if let Some(result) = test.results.last() {
                    if !result.stdout.is_empty() {
                        let _ = writeln!(
                            out,
                            "      <system-out>{}</system-out>",
                            xml_escape(&self.clean(&result.stdout.join("\n")))
                        );
                    }
                    if !result.stderr.is_empty() {
                        let _ = writeln!(
                            out,
                            "      <system-err>{}</system-err>",
                            xml_escape(&self.clean(&result.stderr.join("\n")))
                        );
                    }
                }

                out.push_str("    </testcase>\n");
            }

            out.push_str("  </testsuite>\n");
        }

        out.push_str("</testsuites>\n");
        out
    }
}

impl Reporter for JunitReporter {
    fn name(&self) -> &str {
        "junit"
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        let rendered = self.render(plan, summary);
        match &self.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(error) = std::fs::write(path, rendered) {
                    warn!("failed to write junit report to {}: {error}", path.display());
                }
            }
            None => print!("{rendered}"),
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Drop control characters XML 1.0 forbids (everything below 0x20 except
/// tab, newline, carriage return).
fn strip_forbidden_controls(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

fn strip_ansi(s: &str) -> String {
    // CSI sequences cover the color and cursor codes test output carries.
    let pattern = Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex");
    pattern.replace_all(s, "").into_owned()
}

/// CDATA cannot contain its own terminator.
fn cdata_safe(s: &str) -> String {
    s.replace("]]>", "]]&gt;")
}
