//! Per-test runtime handle and callable types
//!
//! `TestInfo` is the handle a test body (and every hook) receives. It is a
//! cheap clone over shared state so suspended bodies and the timeout
//! supervisor observe the same flags.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;

use super::test::{Annotation, TestStatus};

/// Shallow key/value bag shared between env lifecycles, hooks, and bodies.
pub type StateBag = serde_json::Map<String, Value>;

/// Shallow-merge `src` into `dst`, later keys winning.
pub fn merge_bag(dst: &mut StateBag, src: StateBag) {
    for (key, value) in src {
        dst.insert(key, value);
    }
}

pub type TestFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type HookFuture = BoxFuture<'static, anyhow::Result<Option<StateBag>>>;

/// A test body. Receives the runtime handle plus the merged state bag.
pub type TestBody = Arc<dyn Fn(TestArgs) -> TestFuture + Send + Sync>;

/// A hook body. `beforeAll`/`beforeEach` may return a bag to merge into the
/// worker/test state; `afterAll`/`afterEach` return `None`.
pub type HookBody = Arc<dyn Fn(HookArgs) -> HookFuture + Send + Sync>;

/// Arguments handed to a test body.
pub struct TestArgs {
    pub info: TestInfo,
    pub state: StateBag,
}

/// Arguments handed to a hook body. `test` is `None` for the `*All` hooks.
pub struct HookArgs {
    pub test: Option<TestInfo>,
    pub state: StateBag,
    pub worker: WorkerInfo,
}

/// Identity of the executing worker, visible to `beforeAll`/`afterAll`.
#[derive(Clone, Debug, Default)]
pub struct WorkerInfo {
    pub worker_index: u32,
    pub variant_tag: String,
    pub variant: StateBag,
}

struct InfoState {
    title: String,
    full_title: String,
    file: PathBuf,
    line: u32,
    column: u32,
    retry: u32,
    repeat_each_index: u32,
    variant_tag: String,
    timeout_ms: u64,
    started: Instant,
    timed_out: bool,
    expected_to_fail: bool,
    skipped: bool,
    status: Option<TestStatus>,
    data: StateBag,
    annotations: Vec<Annotation>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    io_forward: Option<Arc<dyn Fn(bool, &str) + Send + Sync>>,
    artifact_dir: Option<PathBuf>,
}

/// Cloneable runtime handle for one test attempt.
#[derive(Clone)]
pub struct TestInfo {
    shared: Arc<Mutex<InfoState>>,
    timeout_changed: Arc<Notify>,
}

impl TestInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: impl Into<String>,
        full_title: impl Into<String>,
        file: impl Into<PathBuf>,
        line: u32,
        column: u32,
        retry: u32,
        repeat_each_index: u32,
        variant_tag: impl Into<String>,
        timeout_ms: u64,
        expected_to_fail: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(InfoState {
                title: title.into(),
                full_title: full_title.into(),
                file: file.into(),
                line,
                column,
                retry,
                repeat_each_index,
                variant_tag: variant_tag.into(),
                timeout_ms,
                started: Instant::now(),
                timed_out: false,
                expected_to_fail,
                skipped: false,
                status: None,
                data: StateBag::new(),
                annotations: Vec::new(),
                stdout: Vec::new(),
                stderr: Vec::new(),
                io_forward: None,
                artifact_dir: None,
            })),
            timeout_changed: Arc::new(Notify::new()),
        }
    }

    pub fn title(&self) -> String {
        self.lock().title.clone()
    }

    pub fn full_title(&self) -> String {
        self.lock().full_title.clone()
    }

    pub fn file(&self) -> PathBuf {
        self.lock().file.clone()
    }

    pub fn line(&self) -> u32 {
        self.lock().line
    }

    pub fn column(&self) -> u32 {
        self.lock().column
    }

    pub fn retry(&self) -> u32 {
        self.lock().retry
    }

    pub fn repeat_each_index(&self) -> u32 {
        self.lock().repeat_each_index
    }

    pub fn variant_tag(&self) -> String {
        self.lock().variant_tag.clone()
    }

    pub fn timeout(&self) -> u64 {
        self.lock().timeout_ms
    }

    /// Replace the effective timeout. Replacing it after the current budget
    /// already elapsed marks the test timed out.
    pub fn set_timeout(&self, timeout_ms: u64) {
        {
            let mut state = self.lock();
            if state.started.elapsed().as_millis() as u64 >= state.timeout_ms {
                state.timed_out = true;
            }
            state.timeout_ms = timeout_ms;
        }
        self.timeout_changed.notify_waiters();
    }

    /// Triple the current budget for a known-slow test.
    pub fn slow(&self) {
        {
            let mut state = self.lock();
            state.timeout_ms = state.timeout_ms.saturating_mul(3);
        }
        self.timeout_changed.notify_waiters();
    }

    pub fn skip(&self) {
        self.lock().skipped = true;
    }

    pub fn skip_when(&self, condition: bool) {
        if condition {
            self.skip();
        }
    }

    /// Mark this attempt as expected to fail.
    pub fn fail(&self) {
        self.lock().expected_to_fail = true;
    }

    pub fn fail_when(&self, condition: bool) {
        if condition {
            self.fail();
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.lock().skipped
    }

    pub fn expected_to_fail(&self) -> bool {
        self.lock().expected_to_fail
    }

    pub fn status(&self) -> Option<TestStatus> {
        self.lock().status
    }

    pub fn set_status(&self, status: TestStatus) {
        self.lock().status = Some(status);
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.lock().data.insert(key.into(), value);
    }

    pub fn data(&self) -> StateBag {
        self.lock().data.clone()
    }

    pub fn annotate(&self, kind: impl Into<String>, description: Option<String>) {
        self.lock().annotations.push(Annotation {
            kind: kind.into(),
            description,
        });
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        self.lock().annotations.clone()
    }

    pub fn mark_timed_out(&self) {
        self.lock().timed_out = true;
    }

    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    /// Write a line of captured standard output for this test. The chunk is
    /// recorded on the result and streamed to the parent when attached.
    pub fn write_stdout(&self, text: impl Into<String>) {
        self.write_io(false, text.into());
    }

    pub fn write_stderr(&self, text: impl Into<String>) {
        self.write_io(true, text.into());
    }

    fn write_io(&self, is_stderr: bool, text: String) {
        let forward = {
            let mut state = self.lock();
            if is_stderr {
                state.stderr.push(text.clone());
            } else {
                state.stdout.push(text.clone());
            }
            state.io_forward.clone()
        };
        if let Some(forward) = forward {
            forward(is_stderr, &text);
        }
    }

    /// Install the stream forwarding the captured chunks to the parent.
    pub fn attach_io(&self, forward: Arc<dyn Fn(bool, &str) + Send + Sync>) {
        self.lock().io_forward = Some(forward);
    }

    /// Directory reserved for this test's artifacts, partitioned by file,
    /// title, and variant so retries and variants never collide. The
    /// directory is not created until user code asks for it.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        self.lock().artifact_dir.clone()
    }

    pub fn set_artifact_dir(&self, dir: PathBuf) {
        self.lock().artifact_dir = Some(dir);
    }

    pub fn captured_stdout(&self) -> Vec<String> {
        self.lock().stdout.clone()
    }

    pub fn captured_stderr(&self) -> Vec<String> {
        self.lock().stderr.clone()
    }

    /// Monotonic start of this attempt.
    pub fn started(&self) -> Instant {
        self.lock().started
    }

    /// Absolute monotonic deadline under the current budget.
    pub fn deadline(&self) -> Instant {
        let state = self.lock();
        state.started + std::time::Duration::from_millis(state.timeout_ms)
    }

    /// Resolves whenever `set_timeout`/`slow` adjust the budget.
    pub async fn timeout_changed(&self) {
        self.timeout_changed.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InfoState> {
        self.shared.lock().expect("test info lock poisoned")
    }
}

#[cfg(test)]
pub(crate) fn noop_test_body() -> TestBody {
    Arc::new(|_args| -> TestFuture { Box::pin(async { Ok(()) }) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(timeout_ms: u64) -> TestInfo {
        TestInfo::new(
            "adds",
            "math adds",
            "a.spec.rs",
            3,
            5,
            0,
            0,
            "",
            timeout_ms,
            false,
        )
    }

    #[test]
    fn slow_triples_timeout() {
        let info = make_info(1000);
        info.slow();
        assert_eq!(info.timeout(), 3000);
    }

    #[test]
    fn set_timeout_replaces_budget() {
        let info = make_info(1000);
        info.set_timeout(250);
        assert_eq!(info.timeout(), 250);
        assert!(!info.timed_out());
    }

    #[test]
    fn set_timeout_after_expiry_marks_timed_out() {
        let info = make_info(0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        info.set_timeout(10_000);
        assert!(info.timed_out());
        assert_eq!(info.timeout(), 10_000);
    }

    #[test]
    fn skip_and_fail_flags() {
        let info = make_info(1000);
        info.skip_when(false);
        assert!(!info.is_skipped());
        info.skip_when(true);
        assert!(info.is_skipped());
        info.fail();
        assert!(info.expected_to_fail());
    }

    #[test]
    fn data_and_annotations_accumulate() {
        let info = make_info(1000);
        info.set_data("answer", serde_json::json!(42));
        info.annotate("issue", Some("flaky upstream".into()));
        assert_eq!(info.data().get("answer"), Some(&serde_json::json!(42)));
        assert_eq!(info.annotations().len(), 1);
    }

    #[test]
    fn merge_bag_later_keys_win() {
        let mut dst = StateBag::new();
        dst.insert("a".into(), serde_json::json!(1));
        let mut src = StateBag::new();
        src.insert("a".into(), serde_json::json!(2));
        src.insert("b".into(), serde_json::json!(3));
        merge_bag(&mut dst, src);
        assert_eq!(dst.get("a"), Some(&serde_json::json!(2)));
        assert_eq!(dst.get("b"), Some(&serde_json::json!(3)));
    }
}
