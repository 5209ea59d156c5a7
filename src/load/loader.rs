//! Loader and registration surface
//!
//! Registration is side-effectful: the "currently loading file" slot and the
//! suite stack live in an explicit [`Loader`] rather than process globals.
//! The author-facing [`TestApi`] closes over the live loader and rejects
//! calls while it is idle.

use std::future::Future;
use std::panic::{AssertUnwindSafe, Location};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

use crate::models::{
    Hook, HookArgs, HookFuture, HookKind, SourceLocation, Spec, StateBag, SuiteArena, Suite,
    SuiteId, TestArgs,
};

use super::env::{Env, FactoryRegistry, RunWithOptions};
use super::files::{FileEntry, FileKind};

/// Misuse of the registration surface, detected at file load time.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("{api} can only be called while a test file is loading")]
    RegistrationPhaseViolation { api: &'static str },
    #[error("Hook can only be defined in a test file")]
    HookOutsideTestFile,
    #[error("runWith can only be called from a fixture file")]
    RunWithOutsideFixtureFile,
}

/// Why a file failed to load. A load failure never aborts the run; the
/// generator synthesizes one failing test for the file instead.
#[derive(Clone, Debug, Error)]
pub enum LoadError {
    #[error("{0}")]
    Registration(#[from] RegistrationError),
    #[error("file panicked during load: {0}")]
    Panic(String),
    #[error("file is already being loaded: {0}")]
    ReentrantLoad(String),
    #[error("no registered loader for {0}")]
    Unregistered(String),
}

struct CurrentFile {
    path: PathBuf,
    kind: FileKind,
    source: &'static str,
}

struct LoaderState {
    arena: SuiteArena,
    factories: FactoryRegistry,
    current: Option<CurrentFile>,
    stack: Vec<SuiteId>,
    violations: Vec<RegistrationError>,
    next_ordinal: usize,
}

/// Owns the spec tree being built and the factory registry. One loader per
/// process; the worker builds its own from the same file callbacks.
pub struct Loader {
    state: Mutex<LoaderState>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoaderState {
                arena: SuiteArena::new(),
                factories: FactoryRegistry::new(),
                current: None,
                stack: Vec::new(),
                violations: Vec::new(),
                next_ordinal: 0,
            }),
        }
    }

    /// Run a registered file callback under this loader. Returns the file's
    /// root suite, or the first violation/panic the callback produced.
    pub fn load_file(self: &Arc<Self>, entry: &FileEntry) -> Result<SuiteId, LoadError> {
        let root = {
            let mut state = self.lock();
            if let Some(current) = &state.current {
                return Err(LoadError::ReentrantLoad(current.path.display().to_string()));
            }
            let root = state
                .arena
                .add_suite(Suite::new("", entry.path.clone(), None));
            state.current = Some(CurrentFile {
                path: entry.path.clone(),
                kind: entry.kind,
                source: entry.source,
            });
            state.stack.push(root);
            state.next_ordinal = 0;
            root
        };

        debug!("loading {}", entry.path.display());
        let api = TestApi {
            loader: Arc::clone(self),
            factory: 0,
        };
        let callback = entry.callback.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&api)));

        let mut state = self.lock();
        state.current = None;
        state.stack.clear();
        let violations = std::mem::take(&mut state.violations);
        drop(state);

        if let Err(panic) = outcome {
            return Err(LoadError::Panic(panic_message(&panic)));
        }
        if let Some(first) = violations.into_iter().next() {
            return Err(LoadError::Registration(first));
        }
        Ok(root)
    }

    /// Read access to the finished tree and factory registry.
    pub fn with_tree<R>(&self, f: impl FnOnce(&SuiteArena, &FactoryRegistry) -> R) -> R {
        let state = self.lock();
        f(&state.arena, &state.factories)
    }

    pub fn root_for_file(&self, path: &Path) -> Option<SuiteId> {
        self.lock().arena.root_for_file(path)
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().expect("loader lock poisoned")
    }

    fn record_violation(&self, violation: RegistrationError) {
        let mut state = self.lock();
        if state.current.is_some() {
            state.violations.push(violation);
        } else {
            // Nothing is loading; surface the misuse loudly since there is no
            // load result to attach it to.
            tracing::error!("{violation}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Author-facing registration handle, bound to one test factory.
#[derive(Clone)]
pub struct TestApi {
    loader: Arc<Loader>,
    factory: usize,
}

impl TestApi {
    pub fn describe(&self, title: impl Into<String>, body: impl FnOnce(&TestApi)) {
        self.describe_inner(title.into(), false, false, body);
    }

    pub fn describe_only(&self, title: impl Into<String>, body: impl FnOnce(&TestApi)) {
        self.describe_inner(title.into(), true, false, body);
    }

    pub fn describe_skip(&self, title: impl Into<String>, body: impl FnOnce(&TestApi)) {
        self.describe_inner(title.into(), false, true, body);
    }

    fn describe_inner(
        &self,
        title: String,
        focused: bool,
        skipped: bool,
        body: impl FnOnce(&TestApi),
    ) {
        let pushed = {
            let mut state = self.loader.lock();
            if state.current.is_none() {
                drop(state);
                self.loader.record_violation(RegistrationError::RegistrationPhaseViolation {
                    api: "describe",
                });
                return;
            }
            let parent = *state.stack.last().expect("suite stack empty during load");
            let file = state.arena.suite(parent).file.clone();
            let mut suite = Suite::new(title, file, Some(parent));
            suite.focused = focused;
            suite.skipped = skipped;
            let id = state.arena.add_suite(suite);
            state.stack.push(id);
            id
        };
        body(self);
        let mut state = self.loader.lock();
        debug_assert_eq!(state.stack.last(), Some(&pushed));
        state.stack.pop();
    }

    #[track_caller]
    pub fn test<F, Fut>(&self, title: impl Into<String>, body: F)
    where
        F: Fn(TestArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(title.into(), body, false, false, false, Location::caller());
    }

    #[track_caller]
    pub fn test_only<F, Fut>(&self, title: impl Into<String>, body: F)
    where
        F: Fn(TestArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(title.into(), body, true, false, false, Location::caller());
    }

    #[track_caller]
    pub fn test_skip<F, Fut>(&self, title: impl Into<String>, body: F)
    where
        F: Fn(TestArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(title.into(), body, false, true, false, Location::caller());
    }

    /// Register a spec that is expected to fail.
    #[track_caller]
    pub fn test_fail<F, Fut>(&self, title: impl Into<String>, body: F)
    where
        F: Fn(TestArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_test(title.into(), body, false, false, true, Location::caller());
    }

    fn add_test<F, Fut>(
        &self,
        title: String,
        body: F,
        focused: bool,
        skipped: bool,
        expected_to_fail: bool,
        location: &'static Location<'static>,
    ) where
        F: Fn(TestArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut state = self.loader.lock();
        if state.current.is_none() {
            drop(state);
            self.loader
                .record_violation(RegistrationError::RegistrationPhaseViolation { api: "test" });
            return;
        }
        let suite = *state.stack.last().expect("suite stack empty during load");
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        let body: crate::models::TestBody =
            Arc::new(move |args| -> crate::models::TestFuture { Box::pin(body(args)) });
        state.arena.add_spec(Spec {
            title,
            suite,
            location: SourceLocation::new(location.file(), location.line(), location.column()),
            body,
            focused,
            skipped,
            expected_to_fail,
            slow: false,
            factory: self.factory,
            file_ordinal: ordinal,
        });
    }

    #[track_caller]
    pub fn before_all<F, Fut>(&self, body: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<StateBag>>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeAll, body, Location::caller());
    }

    #[track_caller]
    pub fn after_all<F, Fut>(&self, body: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<StateBag>>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterAll, body, Location::caller());
    }

    #[track_caller]
    pub fn before_each<F, Fut>(&self, body: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<StateBag>>> + Send + 'static,
    {
        self.add_hook(HookKind::BeforeEach, body, Location::caller());
    }

    #[track_caller]
    pub fn after_each<F, Fut>(&self, body: F)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<StateBag>>> + Send + 'static,
    {
        self.add_hook(HookKind::AfterEach, body, Location::caller());
    }

    fn add_hook<F, Fut>(&self, kind: HookKind, body: F, location: &'static Location<'static>)
    where
        F: Fn(HookArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<StateBag>>> + Send + 'static,
    {
        let mut state = self.loader.lock();
        let Some(current) = &state.current else {
            drop(state);
            self.loader
                .record_violation(RegistrationError::RegistrationPhaseViolation { api: "hook" });
            return;
        };
        if current.source != location.file() {
            drop(state);
            self.loader.record_violation(RegistrationError::HookOutsideTestFile);
            return;
        }
        let suite = *state.stack.last().expect("suite stack empty during load");
        let body: crate::models::HookBody =
            Arc::new(move |args| -> HookFuture { Box::pin(body(args)) });
        state.arena.suite_mut(suite).add_hook(Hook {
            kind,
            body,
            location: SourceLocation::new(location.file(), location.line(), location.column()),
        });
    }

    /// Mark the enclosing suite skipped.
    pub fn skip(&self) {
        self.mark(|suite| suite.skipped = true, "skip");
    }

    /// Mark the enclosing suite expected-to-fail; its specs inherit the flag.
    pub fn fail(&self) {
        self.mark(|suite| suite.expected_to_fail = true, "fail");
    }

    /// Mark the enclosing suite slow (triples the timeout of its specs).
    pub fn slow(&self) {
        self.mark(|suite| suite.slow = true, "slow");
    }

    fn mark(&self, apply: impl FnOnce(&mut Suite), api: &'static str) {
        let mut state = self.loader.lock();
        if state.current.is_none() {
            drop(state);
            self.loader
                .record_violation(RegistrationError::RegistrationPhaseViolation { api });
            return;
        }
        let suite = *state.stack.last().expect("suite stack empty during load");
        apply(state.arena.suite_mut(suite));
    }

    /// Bind an env to this factory, producing one variant per call. Only
    /// legal while a fixture file is loading.
    pub fn run_with(&self, env: Option<Arc<dyn Env>>, options: RunWithOptions) {
        let mut state = self.loader.lock();
        match &state.current {
            None => {
                drop(state);
                self.loader.record_violation(RegistrationError::RegistrationPhaseViolation {
                    api: "runWith",
                });
            }
            Some(current) if current.kind != FileKind::Fixture => {
                drop(state);
                self.loader
                    .record_violation(RegistrationError::RunWithOutsideFixtureFile);
            }
            Some(_) => {
                state.factories.bind(self.factory, env, options);
            }
        }
    }

    /// Derive a factory with no env of its own.
    pub fn declare(&self) -> TestApi {
        let factory = {
            let mut state = self.loader.lock();
            state.factories.declare(self.factory)
        };
        TestApi {
            loader: Arc::clone(&self.loader),
            factory,
        }
    }

    /// Derive a factory whose env lifecycles run outside this one's.
    pub fn extend(&self, env: Arc<dyn Env>) -> TestApi {
        let factory = {
            let mut state = self.loader.lock();
            state.factories.extend(self.factory, env)
        };
        TestApi {
            loader: Arc::clone(&self.loader),
            factory,
        }
    }

    pub fn factory_index(&self) -> usize {
        self.factory
    }
}
