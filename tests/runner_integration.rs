//! End-to-end pipeline tests: register files, generate the plan, execute the
//! groups on a worker runtime, fold the results back, and render reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::unbounded_channel;

use specrun::generate::{generate, LoadedFile, TestPlan};
use specrun::load::{FileKind, FileRegistry, Loader};
use specrun::models::{TestStatus, WorkerInfo};
use specrun::protocol::WorkerMessage;
use specrun::report::{JunitReporter, Reporter, RunSummary};
use specrun::worker::WorkerRuntime;
use specrun::RunConfig;

/// Build the plan like the parent would, execute every group on a worker
/// runtime like a child would, and fold `testEnd` results back into the plan
/// like the dispatcher would.
async fn run_pipeline(
    config: RunConfig,
    build: impl Fn(&mut FileRegistry),
) -> (TestPlan, Vec<WorkerMessage>) {
    let mut registry = FileRegistry::new();
    build(&mut registry);

    let loader = Arc::new(Loader::new());
    let fixture_paths = registry.paths(FileKind::Fixture);
    for path in &fixture_paths {
        loader
            .load_file(registry.get(path).unwrap())
            .expect("fixture load failed");
    }
    let mut files = Vec::new();
    for path in registry.paths(FileKind::Test) {
        let root = loader
            .load_file(registry.get(&path).unwrap())
            .map_err(|e| e.to_string());
        files.push(LoadedFile { path, root });
    }
    let mut plan = loader
        .with_tree(|arena, factories| generate(arena, factories, &config, &files))
        .expect("generate failed");

    let mut worker_registry = FileRegistry::new();
    build(&mut worker_registry);
    let (sink, mut events) = unbounded_channel();
    let mut runtime = WorkerRuntime::new(worker_registry, config, WorkerInfo::default(), sink);
    runtime
        .load_fixtures(&fixture_paths)
        .expect("worker fixture load failed");
    for group in plan.groups.clone() {
        runtime.run_group(&group).await.expect("group run failed");
    }
    runtime.shutdown().await;
    drop(runtime);

    let mut messages = Vec::new();
    while let Ok(message) = events.try_recv() {
        if let WorkerMessage::TestEnd { test_id, result } = &message {
            let test = plan.test_mut(*test_id);
            test.results.push(result.clone());
            test.annotations.extend(result.annotations.clone());
        }
        messages.push(message);
    }
    (plan, messages)
}

fn register_two_passing_files(registry: &mut FileRegistry) {
    registry.add("a.test.rs", |t| {
        t.test("one", |_cx| async { Ok(()) });
    });
    registry.add("b.test.rs", |t| {
        t.test("two", |_cx| async { Ok(()) });
    });
}

#[tokio::test]
async fn junit_report_for_two_passing_files() {
    let (plan, _) = run_pipeline(RunConfig::default(), register_two_passing_files).await;
    let summary = RunSummary::from_plan(&plan, 42, false);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.expected, 2);
    assert!(summary.ok());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junit.xml");
    let mut reporter = JunitReporter::new(Some(path.clone()), false);
    reporter.on_end(&plan, &summary);

    let xml = std::fs::read_to_string(&path).unwrap();
    assert!(xml.contains(r#"<testsuites tests="2" failures="0""#));
    assert!(xml.contains(r#"<testsuite name="a.test.rs""#));
    assert!(xml.contains(r#"<testsuite name="b.test.rs""#));
}

#[tokio::test]
async fn failing_assertion_is_an_unexpected_failure() {
    let (plan, _) = run_pipeline(RunConfig::default(), |registry| {
        registry.add("one-failure.spec.rs", |t| {
            t.test("one failure", |_cx| async {
                anyhow::ensure!(1 + 1 == 7, "expected 7, got {}", 1 + 1);
                Ok(())
            });
        });
    })
    .await;

    let summary = RunSummary::from_plan(&plan, 10, false);
    assert_eq!(summary.unexpected, 1);
    assert_eq!(summary.expected, 0);
    assert!(!summary.ok());
    let failing = &plan.tests[0];
    assert!(!failing.ok());
    assert!(failing.results[0]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("expected 7"));
}

#[tokio::test]
async fn focus_selects_only_marked_tests_across_files() {
    let (plan, _) = run_pipeline(RunConfig::default(), |registry| {
        registry.add("a.spec.rs", |t| {
            t.describe_only("a", |t| {
                t.test_only("b", |_cx| async { Ok(()) });
                t.test("c", |_cx| async { Ok(()) });
                t.test_only("d", |_cx| async { Ok(()) });
            });
            t.test("e", |_cx| async { Ok(()) });
        });
    })
    .await;

    let titles: Vec<&str> = plan.tests.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, vec!["b", "d"]);
    assert!(plan.tests.iter().all(|t| t.ok()));
}

#[tokio::test]
async fn expected_to_fail_passing_body_reports_passed_unexpectedly() {
    let (plan, _) = run_pipeline(RunConfig::default(), |registry| {
        registry.add("a.spec.rs", |t| {
            t.test_fail("should fail but passes", |_cx| async { Ok(()) });
        });
    })
    .await;

    let test = &plan.tests[0];
    assert_eq!(test.results[0].status, TestStatus::Failed);
    assert_eq!(
        test.results[0].error.as_ref().unwrap().message,
        "passed unexpectedly"
    );
    assert!(!test.ok());
}

#[tokio::test]
async fn retry_attempt_observes_its_retry_index() {
    // The dispatcher re-enqueues a failed test as a single-test group with a
    // bumped retry index; the worker-side contract is that the body observes
    // it. Simulate attempt one directly.
    let config = RunConfig::default();
    let mut registry = FileRegistry::new();
    let register = |registry: &mut FileRegistry| {
        registry.add("a.spec.rs", |t| {
            t.test("passes on retry", |cx| async move {
                anyhow::ensure!(cx.info.retry() == 1, "first attempt fails");
                Ok(())
            });
        });
    };
    register(&mut registry);

    let loader = Arc::new(Loader::new());
    let root = loader
        .load_file(registry.get(Path::new("a.spec.rs")).unwrap())
        .unwrap();
    let files = vec![LoadedFile {
        path: PathBuf::from("a.spec.rs"),
        root: Ok(root),
    }];
    let mut plan = loader
        .with_tree(|arena, factories| generate(arena, factories, &config, &files))
        .unwrap();

    let mut worker_registry = FileRegistry::new();
    register(&mut worker_registry);
    let (sink, mut events) = unbounded_channel();
    let mut runtime = WorkerRuntime::new(worker_registry, config, WorkerInfo::default(), sink);

    // Attempt 0 fails.
    let group = plan.groups[0].clone();
    runtime.run_group(&group).await.unwrap();
    // Attempt 1 runs as a fresh single-test group.
    let retry = group.retry_of(group.entries[0].clone(), 99, 1);
    runtime.run_group(&retry).await.unwrap();
    drop(runtime);

    let mut statuses = Vec::new();
    while let Ok(message) = events.try_recv() {
        if let WorkerMessage::TestEnd { test_id, result } = message {
            statuses.push(result.status);
            plan.test_mut(test_id).results.push(result);
        }
    }
    assert_eq!(statuses, vec![TestStatus::Failed, TestStatus::Passed]);

    let summary = RunSummary::from_plan(&plan, 5, false);
    assert_eq!(summary.flaky, 1);
    assert_eq!(summary.unexpected, 0);
    assert!(summary.ok());
}

#[tokio::test]
async fn variants_and_repeats_expand_and_run() {
    use specrun::RunWithOptions;

    let config = RunConfig {
        repeat_each: 2,
        ..RunConfig::default()
    };
    let (plan, messages) = run_pipeline(config, |registry| {
        registry.add_fixture("env.fixture.rs", |t| {
            t.run_with(
                None,
                RunWithOptions::tagged("alpha").with_param("flavor", serde_json::json!("a")),
            );
            t.run_with(
                None,
                RunWithOptions::tagged("beta").with_param("flavor", serde_json::json!("b")),
            );
        });
        registry.add("a.spec.rs", |t| {
            t.test("sees variant", |cx| async move {
                anyhow::ensure!(cx.state.contains_key("flavor"), "variant params missing");
                Ok(())
            });
        });
    })
    .await;

    // 1 spec x 2 variants x 2 repeats.
    assert_eq!(plan.len(), 4);
    assert_eq!(plan.groups.len(), 4);
    let ends = messages
        .iter()
        .filter(|m| matches!(m, WorkerMessage::TestEnd { .. }))
        .count();
    assert_eq!(ends, 4);
    assert!(plan.tests.iter().all(|t| t.ok()));
    let tags: Vec<&str> = plan.tests.iter().map(|t| t.variant_tag.as_str()).collect();
    assert_eq!(tags, vec!["alpha", "alpha", "beta", "beta"]);
}

#[tokio::test]
async fn grep_regex_filters_the_plan() {
    let config = RunConfig {
        grep: Some(specrun::GrepFilter::parse("/^auth/i")),
        ..RunConfig::default()
    };
    let (plan, _) = run_pipeline(config, |registry| {
        registry.add("a.spec.rs", |t| {
            t.describe("Auth", |t| {
                t.test("login", |_cx| async { Ok(()) });
            });
            t.describe("cart", |t| {
                t.test("checkout", |_cx| async { Ok(()) });
            });
        });
    })
    .await;

    assert_eq!(plan.len(), 1);
    assert_eq!(plan.tests[0].full_title, "Auth login");
}
