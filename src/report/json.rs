//! JSON report
//!
//! Emits one structured document at the end of the run, to the path named by
//! `SPECRUN_JSON_OUTPUT_NAME` or to stdout.

use std::path::PathBuf;

use serde_json::json;
use tracing::warn;

use crate::generate::TestPlan;

use super::{Reporter, RunSummary};

pub struct JsonReporter {
    output: Option<PathBuf>,
}

impl JsonReporter {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var_os("SPECRUN_JSON_OUTPUT_NAME").map(PathBuf::from))
    }

    fn render(&self, plan: &TestPlan, summary: &RunSummary) -> serde_json::Value {
        let tests: Vec<serde_json::Value> = plan
            .tests
            .iter()
            .map(|test| {
                json!({
                    "title": test.title,
                    "fullTitle": test.full_title,
                    "file": test.file.display().to_string(),
                    "line": test.line,
                    "column": test.column,
                    "variantTag": test.variant_tag,
                    "variant": test.variant,
                    "repeatEachIndex": test.repeat_index,
                    "expectedToFail": test.expected_to_fail,
                    "outcome": test.outcome(),
                    "ok": test.ok(),
                    "annotations": test.annotations,
                    "results": test.results,
                })
            })
            .collect();

        json!({
            "summary": {
                "total": summary.total,
                "expected": summary.expected,
                "unexpected": summary.unexpected,
                "flaky": summary.flaky,
                "skipped": summary.skipped,
                "durationMs": summary.duration_ms,
                "interrupted": summary.interrupted,
            },
            "tests": tests,
        })
    }
}

impl Reporter for JsonReporter {
    fn name(&self) -> &str {
        "json"
    }

    fn on_end(&mut self, plan: &TestPlan, summary: &RunSummary) {
        let document = self.render(plan, summary);
        let rendered = match serde_json::to_string_pretty(&document) {
            Ok(rendered) => rendered,
            Err(error) => {
                warn!("failed to render json report: {error}");
                return;
            }
        };
        match &self.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(error) = std::fs::write(path, rendered) {
                    warn!("failed to write json report to {}: {error}", path.display());
                }
            }
            None => println!("{rendered}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        SpecId, StateBag, Test, TestError, TestId, TestResult, TestStatus,
    };
    use std::path::PathBuf;

    fn make_test(id: u32, title: &str, status: TestStatus) -> Test {
        let mut test = Test {
            id: TestId(id),
            spec: SpecId(id as usize),
            title: title.into(),
            full_title: title.into(),
            file: PathBuf::from("a.spec.rs"),
            line: 1,
            column: 1,
            spec_ordinal: id as usize,
            variant_index: 0,
            variant_tag: String::new(),
            variant: StateBag::new(),
            repeat_index: 0,
            timeout_ms: 1000,
            expected_to_fail: false,
            skipped: false,
            results: Vec::new(),
            annotations: Vec::new(),
        };
        let mut result = TestResult::new(0, status);
        if status == TestStatus::Failed {
            result.error = Some(TestError::new("nope"));
        }
        test.results.push(result);
        test
    }

    #[test]
    fn report_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let plan = TestPlan {
            tests: vec![
                make_test(0, "passes", TestStatus::Passed),
                make_test(1, "fails", TestStatus::Failed),
            ],
            groups: Vec::new(),
            load_failures: Vec::new(),
        };
        let summary = RunSummary::from_plan(&plan, 120, false);

        let mut reporter = JsonReporter::new(Some(path.clone()));
        reporter.on_end(&plan, &summary);

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["summary"]["total"], 2);
        assert_eq!(doc["summary"]["unexpected"], 1);
        assert_eq!(doc["tests"][0]["outcome"], "expected");
        assert_eq!(doc["tests"][1]["ok"], false);
        assert_eq!(doc["tests"][1]["results"][0]["status"], "failed");
    }
}
