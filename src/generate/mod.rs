//! Test generation
//!
//! Expands the loaded spec tree into the flat, deterministically ordered test
//! list: one test per spec x variant x repeat. Filters apply in order: focus,
//! skip propagation, grep, shard. The surviving tests are packed into groups
//! sharing `(file, variant, repeat)` so a worker runs each group's
//! `beforeAll`/`afterAll` exactly once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::RunConfig;
use crate::load::{FactoryRegistry, ResolvedVariant};
use crate::models::{
    SpecId, StateBag, SuiteArena, SuiteId, Test, TestError, TestId, TestResult, TestStatus,
};

/// One file the runner attempted to load.
pub struct LoadedFile {
    pub path: PathBuf,
    /// Root suite, or the load failure message.
    pub root: Result<SuiteId, String>,
}

/// A test entry inside a group, matched up by spec ordinal in the worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupEntry {
    pub test_id: TestId,
    pub spec_ordinal: usize,
    pub timeout_ms: u64,
}

/// The unit of work assigned to a worker: a contiguous sub-run of tests
/// sharing file and variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestGroup {
    pub id: u32,
    pub file: PathBuf,
    pub source_factory: usize,
    pub variant_index: usize,
    pub variant_tag: String,
    pub variant: StateBag,
    pub repeat_index: u32,
    pub retry_index: u32,
    pub entries: Vec<GroupEntry>,
}

impl TestGroup {
    /// A single-test group for a retry attempt, so the replacement run gets
    /// fresh `beforeAll` hooks.
    pub fn retry_of(&self, entry: GroupEntry, id: u32, retry_index: u32) -> TestGroup {
        TestGroup {
            id,
            file: self.file.clone(),
            source_factory: self.source_factory,
            variant_index: self.variant_index,
            variant_tag: self.variant_tag.clone(),
            variant: self.variant.clone(),
            repeat_index: self.repeat_index,
            retry_index,
            entries: vec![entry],
        }
    }

    /// The remainder of this group after a crash, re-enqueued as a new group.
    pub fn remainder(&self, surviving: Vec<GroupEntry>, id: u32) -> TestGroup {
        TestGroup {
            id,
            entries: surviving,
            ..self.clone()
        }
    }
}

/// The scheduled plan: every test in run order plus the group queue.
pub struct TestPlan {
    pub tests: Vec<Test>,
    pub groups: Vec<TestGroup>,
    /// Tests synthesized for files that failed to load; their single failed
    /// result is already recorded and they are never dispatched.
    pub load_failures: Vec<TestId>,
}

impl TestPlan {
    pub fn test(&self, id: TestId) -> &Test {
        &self.tests[id.0 as usize]
    }

    pub fn test_mut(&mut self, id: TestId) -> &mut Test {
        &mut self.tests[id.0 as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }
}

/// Focus marks exist while `--forbid-only` is set.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("focused tests are forbidden by --forbid-only")]
pub struct FocusForbidden;

/// Expand, filter, and group. `files` must be in the deterministic run order
/// (sorted paths from discovery).
pub fn generate(
    arena: &SuiteArena,
    factories: &FactoryRegistry,
    config: &RunConfig,
    files: &[LoadedFile],
) -> Result<TestPlan, FocusForbidden> {
    let has_focus = arena.has_focus();
    if has_focus && config.forbid_only {
        return Err(FocusForbidden);
    }

    let grep = config
        .grep
        .as_ref()
        .and_then(|g| g.compile().ok());

    let mut tests: Vec<Test> = Vec::new();
    let mut load_failures = Vec::new();
    let mut group_keys: Vec<(usize, usize, usize, u32)> = Vec::new(); // (file, factory, variant, repeat) per test

    for (file_index, file) in files.iter().enumerate() {
        let root = match &file.root {
            Ok(root) => *root,
            Err(message) => {
                let id = TestId(tests.len() as u32);
                tests.push(synthesize_load_failure(id, &file.path, message));
                load_failures.push(id);
                group_keys.push((file_index, usize::MAX, usize::MAX, 0));
                continue;
            }
        };

        let mut specs = arena.specs_in_order(root);
        if has_focus {
            let keep = focus_filter(arena, root);
            specs.retain(|id| keep.contains(id));
        }

        // Expansion is variant-major so groups come out contiguous.
        let mut expansions: Vec<(SpecId, ResolvedVariant)> = Vec::new();
        for spec_id in &specs {
            let spec = arena.spec(*spec_id);
            for variant in factories.resolve_variants(spec.factory) {
                expansions.push((*spec_id, variant));
            }
        }
        expansions.sort_by(|a, b| {
            (a.1.source_factory, a.1.index, arena.spec(a.0).file_ordinal).cmp(&(
                b.1.source_factory,
                b.1.index,
                arena.spec(b.0).file_ordinal,
            ))
        });

        // Repeat sits between variant and spec in the ordering, so each
        // (variant, repeat) slice is one group.
        let mut slices: Vec<(usize, usize)> = Vec::new(); // (start, end) per variant run
        let mut start = 0usize;
        for i in 1..=expansions.len() {
            let boundary = i == expansions.len() || {
                let (a, b) = (&expansions[i - 1].1, &expansions[i].1);
                (a.source_factory, a.index) != (b.source_factory, b.index)
            };
            if boundary {
                slices.push((start, i));
                start = i;
            }
        }

        for (lo, hi) in slices {
            let variant = expansions[lo].1.clone();
            let repeats = variant.repeat_each.unwrap_or(config.repeat_each).max(1);
            for repeat_index in 0..repeats {
                for (spec_id, _) in &expansions[lo..hi] {
                    let spec = arena.spec(*spec_id);
                    let full_title = arena.full_title(*spec_id);

                    if let Some(grep) = &grep {
                        if !grep.matches(&full_title) {
                            continue;
                        }
                    }

                    let timeout_ms = if arena.is_slow(*spec_id) {
                        config.timeout_ms.saturating_mul(3)
                    } else {
                        config.timeout_ms
                    };

                    let id = TestId(tests.len() as u32);
                    tests.push(Test {
                        id,
                        spec: *spec_id,
                        title: spec.title.clone(),
                        full_title,
                        file: file.path.clone(),
                        line: spec.location.line,
                        column: spec.location.column,
                        spec_ordinal: spec.file_ordinal,
                        variant_index: variant.index,
                        variant_tag: variant.tag.clone(),
                        variant: variant.params.clone(),
                        repeat_index,
                        timeout_ms,
                        expected_to_fail: arena.is_expected_to_fail(*spec_id),
                        skipped: arena.is_skipped(*spec_id),
                        results: Vec::new(),
                        annotations: Vec::new(),
                    });
                    group_keys.push((
                        file_index,
                        variant.source_factory,
                        variant.index,
                        repeat_index,
                    ));
                }
            }
        }
    }

    // Shard selection runs on the filtered, globally ordered list.
    if let Some(shard) = config.shard {
        let mut kept = Vec::new();
        let mut kept_keys = Vec::new();
        let mut shard_index = 0usize;
        for (test, key) in tests.into_iter().zip(group_keys.into_iter()) {
            // Load failures are reported on every shard.
            let selected = key.1 == usize::MAX || shard.selects(shard_index);
            if key.1 != usize::MAX {
                shard_index += 1;
            }
            if selected {
                kept.push(test);
                kept_keys.push(key);
            }
        }
        tests = kept;
        group_keys = kept_keys;
        // Re-number so ids stay dense.
        load_failures.clear();
        for (index, test) in tests.iter_mut().enumerate() {
            test.id = TestId(index as u32);
            if !test.results.is_empty() {
                load_failures.push(test.id);
            }
        }
    }

    let groups = build_groups(&tests, &group_keys, files);
    debug!("generated {} test(s) in {} group(s)", tests.len(), groups.len());

    Ok(TestPlan {
        tests,
        groups,
        load_failures,
    })
}

fn synthesize_load_failure(id: TestId, path: &Path, message: &str) -> Test {
    let mut test = Test {
        id,
        spec: SpecId(usize::MAX),
        title: path.display().to_string(),
        full_title: path.display().to_string(),
        file: path.to_path_buf(),
        line: 0,
        column: 0,
        spec_ordinal: usize::MAX,
        variant_index: 0,
        variant_tag: String::new(),
        variant: StateBag::new(),
        repeat_index: 0,
        timeout_ms: 0,
        expected_to_fail: false,
        skipped: false,
        results: Vec::new(),
        annotations: Vec::new(),
    };
    test.results.push(
        TestResult::new(0, TestStatus::Failed).with_error(TestError::new(message.to_string())),
    );
    test
}

/// Specs surviving focus filtering for one file, per the `.only` semantics:
/// inside a subtree that contains focus marks, only the marked entries (and
/// their subtrees) survive; a focused suite with no inner marks keeps all of
/// its content.
fn focus_filter(arena: &SuiteArena, root: SuiteId) -> HashSet<SpecId> {
    let mut keep = HashSet::new();
    walk_focus(arena, root, false, &mut keep);
    keep
}

fn subtree_has_focus(arena: &SuiteArena, suite: SuiteId) -> bool {
    let s = arena.suite(suite);
    s.focused
        || s.specs.iter().any(|id| arena.spec(*id).focused)
        || s.children.iter().any(|c| subtree_has_focus(arena, *c))
}

fn walk_focus(arena: &SuiteArena, suite_id: SuiteId, keep_all: bool, keep: &mut HashSet<SpecId>) {
    let suite = arena.suite(suite_id);
    let focus_below = suite.specs.iter().any(|id| arena.spec(*id).focused)
        || suite.children.iter().any(|c| subtree_has_focus(arena, *c));

    if focus_below {
        for spec in &suite.specs {
            if arena.spec(*spec).focused {
                keep.insert(*spec);
            }
        }
        for child in &suite.children {
            if subtree_has_focus(arena, *child) {
                walk_focus(arena, *child, arena.suite(*child).focused, keep);
            }
        }
    } else if keep_all {
        for spec in &suite.specs {
            keep.insert(*spec);
        }
        for child in &suite.children {
            walk_focus(arena, *child, true, keep);
        }
    }
}

fn build_groups(
    tests: &[Test],
    keys: &[(usize, usize, usize, u32)],
    files: &[LoadedFile],
) -> Vec<TestGroup> {
    let mut groups: Vec<TestGroup> = Vec::new();
    let mut current_key: Option<(usize, usize, usize, u32)> = None;

    for (test, key) in tests.iter().zip(keys.iter()) {
        if key.1 == usize::MAX {
            // Load-failure placeholder; never dispatched.
            current_key = None;
            continue;
        }
        if current_key != Some(*key) || groups.is_empty() {
            groups.push(TestGroup {
                id: groups.len() as u32,
                file: files[key.0].path.clone(),
                source_factory: key.1,
                variant_index: key.2,
                variant_tag: test.variant_tag.clone(),
                variant: test.variant.clone(),
                repeat_index: test.repeat_index,
                retry_index: 0,
                entries: Vec::new(),
            });
            current_key = Some(*key);
        }
        let group_index = groups.len() - 1;
        groups[group_index].entries.push(GroupEntry {
            test_id: test.id,
            spec_ordinal: test.spec_ordinal,
            timeout_ms: test.timeout_ms,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::load::{FileRegistry, Loader, RunWithOptions, TestApi};

    fn load_and_generate(
        config: &RunConfig,
        register: impl Fn(&TestApi) + Send + Sync + 'static,
    ) -> Result<TestPlan, FocusForbidden> {
        load_and_generate_two(config, register, |_t| {})
    }

    fn load_and_generate_two(
        config: &RunConfig,
        register_a: impl Fn(&TestApi) + Send + Sync + 'static,
        register_b: impl Fn(&TestApi) + Send + Sync + 'static,
    ) -> Result<TestPlan, FocusForbidden> {
        let mut registry = FileRegistry::new();
        registry.add("a.spec.rs", register_a);
        registry.add("b.spec.rs", register_b);
        let loader = Arc::new(Loader::new());
        let mut files = Vec::new();
        for path in ["a.spec.rs", "b.spec.rs"] {
            let entry = registry.get(Path::new(path)).unwrap();
            let root = loader.load_file(entry).map_err(|e| e.to_string());
            files.push(LoadedFile {
                path: PathBuf::from(path),
                root,
            });
        }
        loader.with_tree(|arena, factories| generate(arena, factories, config, &files))
    }

    #[test]
    fn expands_specs_in_declaration_order() {
        let plan = load_and_generate(&RunConfig::default(), |t| {
            t.test("one", |_cx| async { Ok(()) });
            t.describe("group", |t| {
                t.test("two", |_cx| async { Ok(()) });
            });
        })
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.tests[0].full_title, "one");
        assert_eq!(plan.tests[1].full_title, "group two");
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].entries.len(), 2);
    }

    #[test]
    fn repeat_each_multiplies_tests_into_separate_groups() {
        let config = RunConfig {
            repeat_each: 3,
            ..RunConfig::default()
        };
        let plan = load_and_generate(&config, |t| {
            t.test("repeated", |_cx| async { Ok(()) });
        })
        .unwrap();
        assert_eq!(plan.len(), 3);
        let repeats: Vec<u32> = plan.tests.iter().map(|t| t.repeat_index).collect();
        assert_eq!(repeats, vec![0, 1, 2]);
        assert_eq!(plan.groups.len(), 3);
    }

    #[test]
    fn focus_keeps_only_marked_specs() {
        // describe.only("a") with focused b, d; plain c inside; plain e outside.
        let plan = load_and_generate(&RunConfig::default(), |t| {
            t.describe_only("a", |t| {
                t.test_only("b", |_cx| async { Ok(()) });
                t.test("c", |_cx| async { Ok(()) });
                t.test_only("d", |_cx| async { Ok(()) });
            });
            t.test("e", |_cx| async { Ok(()) });
        })
        .unwrap();
        let titles: Vec<&str> = plan.tests.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "d"]);
    }

    #[test]
    fn focused_suite_without_inner_marks_keeps_all() {
        let plan = load_and_generate(&RunConfig::default(), |t| {
            t.describe_only("kept", |t| {
                t.test("x", |_cx| async { Ok(()) });
                t.test("y", |_cx| async { Ok(()) });
            });
            t.test("dropped", |_cx| async { Ok(()) });
        })
        .unwrap();
        let titles: Vec<&str> = plan.tests.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["x", "y"]);
    }

    #[test]
    fn forbid_only_aborts_when_focus_exists() {
        let config = RunConfig {
            forbid_only: true,
            ..RunConfig::default()
        };
        let result = load_and_generate(&config, |t| {
            t.test_only("focused", |_cx| async { Ok(()) });
        });
        assert_eq!(result.err(), Some(FocusForbidden));
    }

    #[test]
    fn skip_marks_propagate_to_tests() {
        let plan = load_and_generate(&RunConfig::default(), |t| {
            t.describe_skip("off", |t| {
                t.test("inside", |_cx| async { Ok(()) });
            });
            t.test("on", |_cx| async { Ok(()) });
        })
        .unwrap();
        assert!(plan.tests[0].skipped);
        assert!(!plan.tests[1].skipped);
    }

    #[test]
    fn grep_filters_by_full_title() {
        let config = RunConfig {
            grep: Some(crate::config::GrepFilter::parse("math")),
            ..RunConfig::default()
        };
        let plan = load_and_generate(&config, |t| {
            t.describe("math", |t| {
                t.test("adds", |_cx| async { Ok(()) });
            });
            t.test("unrelated", |_cx| async { Ok(()) });
        })
        .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tests[0].full_title, "math adds");
    }

    #[test]
    fn shard_is_a_disjoint_cover() {
        let make_config = |shard| RunConfig {
            shard: Some(shard),
            ..RunConfig::default()
        };
        let register = |t: &TestApi| {
            for name in ["t0", "t1", "t2", "t3", "t4"] {
                t.test(name, |_cx| async { Ok(()) });
            }
        };
        let mut seen = Vec::new();
        for current in 1..=2u32 {
            let plan = load_and_generate(
                &make_config(crate::config::Shard { current, total: 2 }),
                register,
            )
            .unwrap();
            seen.extend(plan.tests.iter().map(|t| t.full_title.clone()));
        }
        seen.sort();
        assert_eq!(seen, vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn slow_mark_triples_timeout() {
        let plan = load_and_generate(&RunConfig::default(), |t| {
            t.describe("slow block", |t| {
                t.slow();
                t.test("takes a while", |_cx| async { Ok(()) });
            });
        })
        .unwrap();
        assert_eq!(plan.tests[0].timeout_ms, 30_000);
    }

    #[test]
    fn load_failure_synthesizes_failed_test() {
        let plan = load_and_generate(&RunConfig::default(), |_t| panic!("import explodes"))
            .unwrap();
        assert_eq!(plan.load_failures.len(), 1);
        let failed = plan.test(plan.load_failures[0]);
        assert_eq!(failed.results[0].status, TestStatus::Failed);
        assert!(failed.results[0]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("import explodes"));
        // The synthesized test is not dispatched.
        assert!(plan.groups.iter().all(|g| g
            .entries
            .iter()
            .all(|e| e.test_id != failed.id)));
    }

    #[test]
    fn variants_group_separately() {
        let mut registry = FileRegistry::new();
        registry.add_fixture("env.fixture.rs", |t| {
            t.run_with(None, RunWithOptions::tagged("alpha"));
            t.run_with(None, RunWithOptions::tagged("beta"));
        });
        registry.add("a.spec.rs", |t| {
            t.test("one", |_cx| async { Ok(()) });
            t.test("two", |_cx| async { Ok(()) });
        });
        let loader = Arc::new(Loader::new());
        loader
            .load_file(registry.get(Path::new("env.fixture.rs")).unwrap())
            .unwrap();
        let root = loader
            .load_file(registry.get(Path::new("a.spec.rs")).unwrap())
            .unwrap();
        let files = vec![LoadedFile {
            path: PathBuf::from("a.spec.rs"),
            root: Ok(root),
        }];
        let plan = loader
            .with_tree(|arena, factories| {
                generate(arena, factories, &RunConfig::default(), &files)
            })
            .unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].variant_tag, "alpha");
        assert_eq!(plan.groups[1].variant_tag, "beta");
        assert!(plan.groups.iter().all(|g| g.entries.len() == 2));
    }
}
