//! Spec tree: suites, specs, and hooks
//!
//! Suites and specs form a per-file tree. Cross-references (parent, children)
//! are arena indices rather than owning references, so the tree can be walked
//! in both directions without reference cycles.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::info::{HookBody, TestBody};

/// Index of a suite in the [`SuiteArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuiteId(pub usize);

/// Index of a spec in the [`SuiteArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecId(pub usize);

/// Source position captured at registration time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// The four hook buckets a suite carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::BeforeAll => write!(f, "beforeAll"),
            HookKind::AfterAll => write!(f, "afterAll"),
            HookKind::BeforeEach => write!(f, "beforeEach"),
            HookKind::AfterEach => write!(f, "afterEach"),
        }
    }
}

/// A registered hook: its body and where it was registered.
#[derive(Clone)]
pub struct Hook {
    pub kind: HookKind,
    pub body: HookBody,
    pub location: SourceLocation,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish()
    }
}

/// A node in the spec tree. One parentless root suite exists per file.
pub struct Suite {
    pub title: String,
    pub file: PathBuf,
    pub parent: Option<SuiteId>,
    pub children: Vec<SuiteId>,
    pub specs: Vec<SpecId>,
    pub before_all: Vec<Hook>,
    pub after_all: Vec<Hook>,
    pub before_each: Vec<Hook>,
    pub after_each: Vec<Hook>,
    pub focused: bool,
    pub skipped: bool,
    pub slow: bool,
    pub expected_to_fail: bool,
}

impl Suite {
    pub fn new(title: impl Into<String>, file: impl Into<PathBuf>, parent: Option<SuiteId>) -> Self {
        Self {
            title: title.into(),
            file: file.into(),
            parent,
            children: Vec::new(),
            specs: Vec::new(),
            before_all: Vec::new(),
            after_all: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            focused: false,
            skipped: false,
            slow: false,
            expected_to_fail: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn add_hook(&mut self, hook: Hook) {
        match hook.kind {
            HookKind::BeforeAll => self.before_all.push(hook),
            HookKind::AfterAll => self.after_all.push(hook),
            HookKind::BeforeEach => self.before_each.push(hook),
            HookKind::AfterEach => self.after_each.push(hook),
        }
    }

    pub fn hooks(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::BeforeAll => &self.before_all,
            HookKind::AfterAll => &self.after_all,
            HookKind::BeforeEach => &self.before_each,
            HookKind::AfterEach => &self.after_each,
        }
    }
}

/// A leaf in the spec tree: the author-declared intent of one test.
pub struct Spec {
    pub title: String,
    pub suite: SuiteId,
    pub location: SourceLocation,
    pub body: TestBody,
    pub focused: bool,
    pub skipped: bool,
    pub expected_to_fail: bool,
    pub slow: bool,
    /// Test factory this spec was declared through (variant resolution key).
    pub factory: usize,
    /// Pre-order ordinal of this spec within its file, assigned at load time.
    pub file_ordinal: usize,
}

/// Arena holding every suite and spec registered in this process.
#[derive(Default)]
pub struct SuiteArena {
    suites: Vec<Suite>,
    specs: Vec<Spec>,
    /// Root suites in file registration order.
    roots: Vec<SuiteId>,
}

impl SuiteArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_suite(&mut self, suite: Suite) -> SuiteId {
        let id = SuiteId(self.suites.len());
        let parent = suite.parent;
        self.suites.push(suite);
        match parent {
            Some(p) => self.suites[p.0].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn add_spec(&mut self, spec: Spec) -> SpecId {
        let id = SpecId(self.specs.len());
        let suite = spec.suite;
        self.specs.push(spec);
        self.suites[suite.0].specs.push(id);
        id
    }

    pub fn suite(&self, id: SuiteId) -> &Suite {
        &self.suites[id.0]
    }

    pub fn suite_mut(&mut self, id: SuiteId) -> &mut Suite {
        &mut self.suites[id.0]
    }

    pub fn spec(&self, id: SpecId) -> &Spec {
        &self.specs[id.0]
    }

    pub fn spec_mut(&mut self, id: SpecId) -> &mut Spec {
        &mut self.specs[id.0]
    }

    pub fn roots(&self) -> &[SuiteId] {
        &self.roots
    }

    pub fn root_for_file(&self, file: &Path) -> Option<SuiteId> {
        self.roots
            .iter()
            .copied()
            .find(|id| self.suite(*id).file == file)
    }

    /// Chain of suites from the root down to (and including) `id`.
    pub fn ancestry(&self, id: SuiteId) -> Vec<SuiteId> {
        let mut chain = vec![id];
        let mut cursor = id;
        while let Some(parent) = self.suite(cursor).parent {
            chain.push(parent);
            cursor = parent;
        }
        chain.reverse();
        chain
    }

    /// Space-joined ancestor suite titles plus the spec title. Root suite
    /// titles are empty and do not contribute.
    pub fn full_title(&self, id: SpecId) -> String {
        let spec = self.spec(id);
        let mut parts: Vec<&str> = self
            .ancestry(spec.suite)
            .iter()
            .map(|sid| self.suite(*sid).title.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        parts.push(&spec.title);
        parts.join(" ")
    }

    /// Whether the spec or any ancestor suite carries a skip mark.
    pub fn is_skipped(&self, id: SpecId) -> bool {
        let spec = self.spec(id);
        if spec.skipped {
            return true;
        }
        self.ancestry(spec.suite)
            .iter()
            .any(|sid| self.suite(*sid).skipped)
    }

    /// Whether the spec or any ancestor suite is expected to fail.
    pub fn is_expected_to_fail(&self, id: SpecId) -> bool {
        let spec = self.spec(id);
        if spec.expected_to_fail {
            return true;
        }
        self.ancestry(spec.suite)
            .iter()
            .any(|sid| self.suite(*sid).expected_to_fail)
    }

    /// Whether the spec or any ancestor suite carries a slow mark.
    pub fn is_slow(&self, id: SpecId) -> bool {
        let spec = self.spec(id);
        if spec.slow {
            return true;
        }
        self.ancestry(spec.suite)
            .iter()
            .any(|sid| self.suite(*sid).slow)
    }

    /// Specs of a file in depth-first pre-order (declaration order).
    pub fn specs_in_order(&self, root: SuiteId) -> Vec<SpecId> {
        let mut out = Vec::new();
        self.collect_specs(root, &mut out);
        out
    }

    fn collect_specs(&self, id: SuiteId, out: &mut Vec<SpecId>) {
        let suite = self.suite(id);
        out.extend(suite.specs.iter().copied());
        for child in &suite.children {
            self.collect_specs(*child, out);
        }
    }

    /// Whether any suite or spec in the whole arena is focused.
    pub fn has_focus(&self) -> bool {
        self.suites.iter().any(|s| s.focused) || self.specs.iter().any(|s| s.focused)
    }

    pub fn suite_count(&self) -> usize {
        self.suites.len()
    }

    pub fn spec_count(&self) -> usize {
        self.specs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::info::noop_test_body;

    fn make_spec(arena: &mut SuiteArena, suite: SuiteId, title: &str) -> SpecId {
        arena.add_spec(Spec {
            title: title.into(),
            suite,
            location: SourceLocation::new("a.spec.rs", 1, 1),
            body: noop_test_body(),
            focused: false,
            skipped: false,
            expected_to_fail: false,
            slow: false,
            factory: 0,
            file_ordinal: 0,
        })
    }

    #[test]
    fn full_title_joins_ancestors() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        let outer = arena.add_suite(Suite::new("math", "a.spec.rs", Some(root)));
        let inner = arena.add_suite(Suite::new("addition", "a.spec.rs", Some(outer)));
        let spec = make_spec(&mut arena, inner, "adds");
        assert_eq!(arena.full_title(spec), "math addition adds");
    }

    #[test]
    fn root_title_does_not_contribute() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        let spec = make_spec(&mut arena, root, "lonely");
        assert_eq!(arena.full_title(spec), "lonely");
    }

    #[test]
    fn skip_propagates_from_ancestor() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        let outer = arena.add_suite(Suite::new("outer", "a.spec.rs", Some(root)));
        arena.suite_mut(outer).skipped = true;
        let inner = arena.add_suite(Suite::new("inner", "a.spec.rs", Some(outer)));
        let spec = make_spec(&mut arena, inner, "skipped by ancestor");
        assert!(arena.is_skipped(spec));
    }

    #[test]
    fn specs_in_order_is_preorder() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        let first = make_spec(&mut arena, root, "first");
        let child = arena.add_suite(Suite::new("child", "a.spec.rs", Some(root)));
        let second = make_spec(&mut arena, child, "second");
        let order = arena.specs_in_order(root);
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn has_focus_sees_suites_and_specs() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        assert!(!arena.has_focus());
        let spec = make_spec(&mut arena, root, "focused");
        arena.spec_mut(spec).focused = true;
        assert!(arena.has_focus());
    }

    #[test]
    fn ancestry_runs_root_first() {
        let mut arena = SuiteArena::new();
        let root = arena.add_suite(Suite::new("", "a.spec.rs", None));
        let mid = arena.add_suite(Suite::new("mid", "a.spec.rs", Some(root)));
        let leaf = arena.add_suite(Suite::new("leaf", "a.spec.rs", Some(mid)));
        assert_eq!(arena.ancestry(leaf), vec![root, mid, leaf]);
    }
}
