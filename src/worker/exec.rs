//! Worker-side test execution
//!
//! Runs the tests of one group sequentially: lazy file load, `beforeAll`
//! bookkeeping per worker, the per-test hook pipeline with its symmetric
//! teardown, and status derivation. Every lifecycle event is emitted to the
//! parent through the message sink.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::RunConfig;
use crate::generate::TestGroup;
use crate::load::{Env, FileRegistry, Loader};
use crate::models::{
    merge_bag, HookArgs, HookBody, StateBag, SuiteId, TestArgs, TestBody, TestError, TestId,
    TestInfo, TestResult, TestStatus, WorkerInfo,
};
use crate::protocol::WorkerMessage;

use super::deadline::{supervise, Supervised, Watchdog, OVERRUN_EXIT_CODE};

/// Per-suite hook bundle captured while preparing a group.
struct SuiteSetup {
    suite: SuiteId,
    before_all: Vec<HookBody>,
    after_all: Vec<HookBody>,
}

/// Everything needed to run one test, snapshotted out of the loader so no
/// lock is held across awaits.
struct PreparedTest {
    test_id: TestId,
    title: String,
    full_title: String,
    line: u32,
    column: u32,
    timeout_ms: u64,
    expected_to_fail: bool,
    skipped: bool,
    body: TestBody,
    suite_chain: Vec<SuiteId>,
    /// Outermost-first.
    before_each: Vec<HookBody>,
    /// Innermost-first.
    after_each: Vec<HookBody>,
    suite_setup: Vec<SuiteSetup>,
    /// Most-derived env first.
    envs: Vec<Arc<dyn Env>>,
}

/// Sequential executor living inside one worker process.
pub struct WorkerRuntime {
    loader: Arc<Loader>,
    registry: FileRegistry,
    config: RunConfig,
    worker: WorkerInfo,
    sink: UnboundedSender<WorkerMessage>,
    watchdog: Option<Watchdog>,
    loaded_files: HashSet<PathBuf>,
    current_file: Option<PathBuf>,
    worker_state: StateBag,
    /// Envs whose `before_all` ran, in run order; `after_all` drains reverse.
    envs_started: Vec<Arc<dyn Env>>,
    env_started_keys: HashSet<usize>,
    env_failure: Option<TestError>,
    before_all_done: HashSet<SuiteId>,
    before_all_failures: HashMap<SuiteId, TestError>,
    /// Suites whose `after_all` is still owed, in `before_all` order.
    after_all_pending: Vec<SuiteSetup>,
}

impl WorkerRuntime {
    pub fn new(
        registry: FileRegistry,
        config: RunConfig,
        worker: WorkerInfo,
        sink: UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            loader: Arc::new(Loader::new()),
            registry,
            config,
            worker,
            sink,
            watchdog: None,
            loaded_files: HashSet::new(),
            current_file: None,
            worker_state: StateBag::new(),
            envs_started: Vec::new(),
            env_started_keys: HashSet::new(),
            env_failure: None,
            before_all_done: HashSet::new(),
            before_all_failures: HashMap::new(),
            after_all_pending: Vec::new(),
        }
    }

    /// Arm the overrun watchdog thread. Skipped in in-process tests.
    pub fn with_watchdog(mut self) -> Self {
        self.watchdog = Some(Watchdog::spawn());
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Load fixture files, strictly before any test file.
    pub fn load_fixtures(&mut self, fixture_files: &[PathBuf]) -> Result<()> {
        for path in fixture_files {
            self.load(path)?;
        }
        Ok(())
    }

    fn load(&mut self, path: &PathBuf) -> Result<()> {
        if self.loaded_files.contains(path) {
            return Ok(());
        }
        let entry = self
            .registry
            .get(path)
            .ok_or_else(|| anyhow!("no registered loader for {}", path.display()))?;
        self.loader
            .load_file(entry)
            .with_context(|| format!("failed to load {}", path.display()))?;
        self.loaded_files.insert(path.clone());
        Ok(())
    }

    /// Run one group start to finish, emitting `testBegin`/`testEnd` pairs
    /// and a final `done`.
    pub async fn run_group(&mut self, group: &TestGroup) -> Result<()> {
        if self.current_file.as_ref() != Some(&group.file) {
            // The previous file's suites saw their last test in this worker.
            self.drain_suite_after_alls().await;
        }
        self.load(&group.file)?;
        self.current_file = Some(group.file.clone());

        let prepared = self.prepare(group)?;
        debug!(
            "worker {} running group {} ({} test(s))",
            self.worker.worker_index,
            group.id,
            prepared.len()
        );

        for test in &prepared {
            if !test.skipped {
                self.ensure_setup(test).await;
            }
            self.run_one(group, test).await;
        }

        self.send(WorkerMessage::Done { group_id: group.id });
        Ok(())
    }

    /// Cooperative shutdown: drain owed `afterAll`s, then env `afterAll`s.
    pub async fn shutdown(&mut self) {
        self.drain_suite_after_alls().await;
        let state = self.worker_state.clone();
        for env in self.envs_started.drain(..).rev().collect::<Vec<_>>() {
            if let Err(error) = env.after_all(state.clone()).await {
                self.send(WorkerMessage::Stderr {
                    test_id: None,
                    text: format!("afterAll of env {:?} failed: {error:#}", env.name()),
                });
            }
        }
    }

    fn prepare(&self, group: &TestGroup) -> Result<Vec<PreparedTest>> {
        self.loader.with_tree(|arena, factories| {
            let root = arena
                .root_for_file(&group.file)
                .ok_or_else(|| anyhow!("file {} has no root suite", group.file.display()))?;
            let ordinals: HashMap<usize, _> = arena
                .specs_in_order(root)
                .into_iter()
                .map(|id| (arena.spec(id).file_ordinal, id))
                .collect();

            group
                .entries
                .iter()
                .map(|entry| {
                    let spec_id = *ordinals.get(&entry.spec_ordinal).ok_or_else(|| {
                        anyhow!(
                            "spec ordinal {} not found in {}",
                            entry.spec_ordinal,
                            group.file.display()
                        )
                    })?;
                    let spec = arena.spec(spec_id);
                    let envs = factories
                        .resolve_variants(spec.factory)
                        .into_iter()
                        .find(|v| {
                            v.source_factory == group.source_factory
                                && v.index == group.variant_index
                        })
                        .map(|v| v.envs)
                        .ok_or_else(|| {
                            anyhow!("variant {} not found for group", group.variant_index)
                        })?;

                    let chain = arena.ancestry(spec.suite);
                    let before_each = chain
                        .iter()
                        .flat_map(|sid| arena.suite(*sid).before_each.iter())
                        .map(|h| h.body.clone())
                        .collect();
                    let after_each = chain
                        .iter()
                        .rev()
                        .flat_map(|sid| arena.suite(*sid).after_each.iter())
                        .map(|h| h.body.clone())
                        .collect();
                    let suite_setup = chain
                        .iter()
                        .map(|sid| SuiteSetup {
                            suite: *sid,
                            before_all: arena
                                .suite(*sid)
                                .before_all
                                .iter()
                                .map(|h| h.body.clone())
                                .collect(),
                            after_all: arena
                                .suite(*sid)
                                .after_all
                                .iter()
                                .map(|h| h.body.clone())
                                .collect(),
                        })
                        .collect();

                    Ok(PreparedTest {
                        test_id: entry.test_id,
                        title: spec.title.clone(),
                        full_title: arena.full_title(spec_id),
                        line: spec.location.line,
                        column: spec.location.column,
                        timeout_ms: entry.timeout_ms,
                        expected_to_fail: arena.is_expected_to_fail(spec_id),
                        skipped: arena.is_skipped(spec_id),
                        body: spec.body.clone(),
                        suite_chain: chain,
                        before_each,
                        after_each,
                        suite_setup,
                        envs,
                    })
                })
                .collect()
        })
    }

    /// Run env and suite `beforeAll`s that have not run in this worker yet.
    async fn ensure_setup(&mut self, test: &PreparedTest) {
        for env in &test.envs {
            let key = Arc::as_ptr(env) as *const () as usize;
            if !self.env_started_keys.insert(key) {
                continue;
            }
            match env.before_all(self.worker.clone()).await {
                Ok(Some(bag)) => merge_bag(&mut self.worker_state, bag),
                Ok(None) => {}
                Err(error) => {
                    if self.env_failure.is_none() {
                        self.env_failure = Some(TestError::from_anyhow(&error));
                    }
                }
            }
            self.envs_started.push(env.clone());
        }
        if self.env_failure.is_some() {
            return;
        }

        for setup in &test.suite_setup {
            if !self.before_all_done.insert(setup.suite) {
                continue;
            }
            // Under a failed ancestor setup, deeper beforeAlls do not run and
            // owe no afterAll.
            let inherited = test
                .suite_chain
                .iter()
                .take_while(|sid| **sid != setup.suite)
                .any(|sid| self.before_all_failures.contains_key(sid));
            if inherited {
                continue;
            }

            for hook in &setup.before_all {
                let args = HookArgs {
                    test: None,
                    state: self.worker_state.clone(),
                    worker: self.worker.clone(),
                };
                match hook(args).await {
                    Ok(Some(bag)) => merge_bag(&mut self.worker_state, bag),
                    Ok(None) => {}
                    Err(error) => {
                        self.before_all_failures
                            .entry(setup.suite)
                            .or_insert_with(|| TestError::from_anyhow(&error));
                    }
                }
            }
            self.after_all_pending.push(SuiteSetup {
                suite: setup.suite,
                before_all: Vec::new(),
                after_all: setup.after_all.clone(),
            });
        }
    }

    fn setup_error_for(&self, test: &PreparedTest) -> Option<TestError> {
        if let Some(error) = &self.env_failure {
            return Some(error.clone());
        }
        test.suite_chain
            .iter()
            .find_map(|sid| self.before_all_failures.get(sid))
            .cloned()
    }

    async fn run_one(&mut self, group: &TestGroup, test: &PreparedTest) {
        let start_wall = Utc::now();

        if test.skipped {
            // Registration-time skip: no hooks, no body.
            self.send(WorkerMessage::TestBegin {
                test_id: test.test_id,
                start_wall_clock: start_wall,
            });
            let mut result = TestResult::new(group.retry_index, TestStatus::Skipped);
            result.start_time = start_wall;
            result.timeout_ms = test.timeout_ms;
            self.send(WorkerMessage::TestEnd {
                test_id: test.test_id,
                result,
            });
            return;
        }

        let info = TestInfo::new(
            test.title.clone(),
            test.full_title.clone(),
            group.file.clone(),
            test.line,
            test.column,
            group.retry_index,
            group.repeat_index,
            group.variant_tag.clone(),
            test.timeout_ms,
            test.expected_to_fail,
        );
        info.set_artifact_dir(self.config.artifact_dir(
            &group.file,
            &test.full_title,
            &group.variant_tag,
        ));
        {
            let sink = self.sink.clone();
            let test_id = test.test_id;
            info.attach_io(Arc::new(move |is_stderr, text| {
                let message = if is_stderr {
                    WorkerMessage::Stderr {
                        test_id: Some(test_id),
                        text: text.to_string(),
                    }
                } else {
                    WorkerMessage::Stdout {
                        test_id: Some(test_id),
                        text: text.to_string(),
                    }
                };
                let _ = sink.send(message);
            }));
        }

        self.send(WorkerMessage::TestBegin {
            test_id: test.test_id,
            start_wall_clock: start_wall,
        });
        self.arm(&info);

        let mut first_error = self.setup_error_for(test);
        let mut test_state = self.worker_state.clone();
        merge_bag(&mut test_state, group.variant.clone());
        let mut env_teardown: Vec<Arc<dyn Env>> = Vec::new();

        // Env beforeEach, most-derived first.
        if first_error.is_none() {
            for env in &test.envs {
                match supervise(&info, env.before_each(info.clone(), test_state.clone())).await {
                    Supervised::Completed(Ok(bag)) => {
                        if let Some(bag) = bag {
                            merge_bag(&mut test_state, bag);
                        }
                        env_teardown.push(env.clone());
                    }
                    Supervised::Completed(Err(error)) => {
                        first_error = Some(TestError::from_anyhow(&error));
                        break;
                    }
                    Supervised::TimedOut => {
                        info.mark_timed_out();
                        break;
                    }
                }
            }
        }

        // User beforeEach, outermost-first. A failure skips the body but
        // never the teardown below.
        if first_error.is_none() && !info.timed_out() && !info.is_skipped() {
            for hook in &test.before_each {
                let args = HookArgs {
                    test: Some(info.clone()),
                    state: test_state.clone(),
                    worker: self.worker.clone(),
                };
                match supervise(&info, hook(args)).await {
                    Supervised::Completed(Ok(bag)) => {
                        if let Some(bag) = bag {
                            merge_bag(&mut test_state, bag);
                        }
                    }
                    Supervised::Completed(Err(error)) => {
                        first_error = Some(TestError::from_anyhow(&error));
                        break;
                    }
                    Supervised::TimedOut => {
                        info.mark_timed_out();
                        break;
                    }
                }
            }
        }

        if first_error.is_none() && !info.timed_out() && !info.is_skipped() {
            let args = TestArgs {
                info: info.clone(),
                state: test_state.clone(),
            };
            match supervise(&info, (test.body)(args)).await {
                Supervised::Completed(Ok(())) => {}
                Supervised::Completed(Err(error)) => {
                    first_error = Some(TestError::from_anyhow(&error));
                }
                Supervised::TimedOut => info.mark_timed_out(),
            }
        }

        // Teardown always runs, under the same budget: user afterEach
        // innermost-first, then env afterEach innermost-first. The first
        // error wins; later hooks still run.
        let mut teardown_overrun = false;
        for hook in &test.after_each {
            let args = HookArgs {
                test: Some(info.clone()),
                state: test_state.clone(),
                worker: self.worker.clone(),
            };
            match supervise(&info, hook(args)).await {
                Supervised::Completed(Ok(_)) => {}
                Supervised::Completed(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(TestError::from_anyhow(&error));
                    }
                }
                Supervised::TimedOut => {
                    teardown_overrun = true;
                    break;
                }
            }
        }
        if !teardown_overrun {
            for env in env_teardown.iter().rev() {
                match supervise(&info, env.after_each(test_state.clone())).await {
                    Supervised::Completed(Ok(())) => {}
                    Supervised::Completed(Err(error)) => {
                        if first_error.is_none() {
                            first_error = Some(TestError::from_anyhow(&error));
                        }
                    }
                    Supervised::TimedOut => {
                        teardown_overrun = true;
                        break;
                    }
                }
            }
        }

        let result = self.derive_result(group, &info, first_error, start_wall);
        self.send(WorkerMessage::TestEnd {
            test_id: test.test_id,
            result,
        });
        self.disarm();

        if teardown_overrun {
            // Teardown has no budget left; the dispatcher's crash recovery
            // path takes over the rest of the group.
            self.send(WorkerMessage::FatalError {
                error: TestError::new("teardown overran the test timeout"),
            });
            std::process::exit(OVERRUN_EXIT_CODE);
        }
    }

    fn derive_result(
        &self,
        group: &TestGroup,
        info: &TestInfo,
        mut first_error: Option<TestError>,
        start_wall: chrono::DateTime<Utc>,
    ) -> TestResult {
        let expected_to_fail = info.expected_to_fail();
        let status = if info.timed_out() {
            if first_error.is_none() {
                first_error = Some(TestError::new(format!(
                    "Timeout of {}ms exceeded.",
                    info.timeout()
                )));
            }
            TestStatus::TimedOut
        } else if info.is_skipped() {
            TestStatus::Skipped
        } else if first_error.is_some() {
            if expected_to_fail {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            }
        } else if expected_to_fail {
            first_error = Some(TestError::new("passed unexpectedly"));
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };
        info.set_status(status);

        let mut result = TestResult::new(group.retry_index, status);
        result.start_time = start_wall;
        result.duration_ms = info.started().elapsed().as_millis() as u64;
        result.error = first_error;
        result.stdout = info.captured_stdout();
        result.stderr = info.captured_stderr();
        result.data = info.data();
        result.annotations = info.annotations();
        result.timeout_ms = info.timeout();
        result
    }

    async fn drain_suite_after_alls(&mut self) {
        while let Some(setup) = self.after_all_pending.pop() {
            for hook in &setup.after_all {
                let args = HookArgs {
                    test: None,
                    state: self.worker_state.clone(),
                    worker: self.worker.clone(),
                };
                if let Err(error) = hook(args).await {
                    self.send(WorkerMessage::Stderr {
                        test_id: None,
                        text: format!("afterAll failed: {error:#}"),
                    });
                }
            }
        }
    }

    fn arm(&self, info: &TestInfo) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.arm(info.deadline());
        }
    }

    fn disarm(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm();
        }
    }

    fn send(&self, message: WorkerMessage) {
        let _ = self.sink.send(message);
    }
}
