//! Environment fixtures and test factories
//!
//! An [`Env`] contributes up to four lifecycle operations around the tests it
//! is bound to. Factories form a chain through `declare`/`extend`; variants
//! are resolved at generation time by folding that chain into an ordered env
//! list, most-derived first.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::models::{StateBag, TestInfo, WorkerInfo};

pub type EnvFuture<'a, T> = BoxFuture<'a, anyhow::Result<T>>;

/// Lifecycle contract of a declared environment. All operations default to
/// no-ops; `before_all`/`before_each` may return a bag that is merged into
/// the worker/test state.
pub trait Env: Send + Sync {
    fn name(&self) -> &str {
        "env"
    }

    fn before_all(&self, worker: WorkerInfo) -> EnvFuture<'_, Option<StateBag>> {
        let _ = worker;
        Box::pin(async { Ok(None) })
    }

    fn after_all(&self, state: StateBag) -> EnvFuture<'_, ()> {
        let _ = state;
        Box::pin(async { Ok(()) })
    }

    fn before_each(&self, test: TestInfo, state: StateBag) -> EnvFuture<'_, Option<StateBag>> {
        let _ = (test, state);
        Box::pin(async { Ok(None) })
    }

    fn after_each(&self, state: StateBag) -> EnvFuture<'_, ()> {
        let _ = state;
        Box::pin(async { Ok(()) })
    }
}

/// Options for one `run_with` binding.
#[derive(Clone, Default)]
pub struct RunWithOptions {
    /// Display tag; defaults to the env name.
    pub tag: Option<String>,
    /// Per-binding repeat multiplier; defaults to the run config.
    pub repeat_each: Option<u32>,
    /// Arbitrary key/value variant parameters, visible on every test.
    pub params: StateBag,
}

impl RunWithOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_repeat_each(mut self, repeat_each: u32) -> Self {
        self.repeat_each = Some(repeat_each);
        self
    }
}

/// One node in the factory chain. The root factory has no parent and no env.
pub struct FactoryNode {
    pub parent: Option<usize>,
    pub env: Option<Arc<dyn Env>>,
}

/// A `run_with` registration: `(env, tag, options)` bound to a factory.
pub struct VariantBinding {
    pub factory: usize,
    pub env: Option<Arc<dyn Env>>,
    pub tag: String,
    pub params: StateBag,
    pub repeat_each: Option<u32>,
}

/// A variant after folding the factory chain: the ordered env list to invoke.
#[derive(Clone)]
pub struct ResolvedVariant {
    /// Factory whose bindings produced this variant (self when unbound).
    /// Together with `index` this identifies the variant across processes.
    pub source_factory: usize,
    /// Deterministic index within the factory's binding list.
    pub index: usize,
    pub tag: String,
    /// Most-derived env first; `before_*` iterate forward, `after_*` reverse.
    pub envs: Vec<Arc<dyn Env>>,
    pub params: StateBag,
    pub repeat_each: Option<u32>,
}

impl fmt::Debug for ResolvedVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedVariant")
            .field("index", &self.index)
            .field("tag", &self.tag)
            .field("envs", &self.envs.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("repeat_each", &self.repeat_each)
            .finish()
    }
}

/// Factory chain plus `run_with` bindings, filled in at file load time.
#[derive(Default)]
pub struct FactoryRegistry {
    nodes: Vec<FactoryNode>,
    bindings: Vec<VariantBinding>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            nodes: Vec::new(),
            bindings: Vec::new(),
        };
        registry.nodes.push(FactoryNode {
            parent: None,
            env: None,
        });
        registry
    }

    pub fn root(&self) -> usize {
        0
    }

    /// Derive a factory with no env of its own.
    pub fn declare(&mut self, parent: usize) -> usize {
        self.nodes.push(FactoryNode {
            parent: Some(parent),
            env: None,
        });
        self.nodes.len() - 1
    }

    /// Derive a factory whose env lifecycles run outside the base's.
    pub fn extend(&mut self, parent: usize, env: Arc<dyn Env>) -> usize {
        self.nodes.push(FactoryNode {
            parent: Some(parent),
            env: Some(env),
        });
        self.nodes.len() - 1
    }

    pub fn bind(&mut self, factory: usize, env: Option<Arc<dyn Env>>, options: RunWithOptions) {
        let tag = options
            .tag
            .or_else(|| env.as_ref().map(|e| e.name().to_string()))
            .unwrap_or_default();
        self.bindings.push(VariantBinding {
            factory,
            env,
            tag,
            params: options.params,
            repeat_each: options.repeat_each,
        });
    }

    /// Variants a spec of `factory` expands into, in binding order. With no
    /// binding on the factory or any ancestor, a single untagged variant made
    /// of the factory's own env chain is produced.
    pub fn resolve_variants(&self, factory: usize) -> Vec<ResolvedVariant> {
        // Nearest factory in the ancestor chain that carries bindings.
        let mut bound_at = None;
        let mut cursor = Some(factory);
        while let Some(node) = cursor {
            if self.bindings.iter().any(|b| b.factory == node) {
                bound_at = Some(node);
                break;
            }
            cursor = self.nodes[node].parent;
        }

        let Some(bound_at) = bound_at else {
            return vec![ResolvedVariant {
                source_factory: factory,
                index: 0,
                tag: String::new(),
                envs: self.chain_envs(factory, None),
                params: StateBag::new(),
                repeat_each: None,
            }];
        };

        self.bindings
            .iter()
            .filter(|b| b.factory == bound_at)
            .enumerate()
            .map(|(index, binding)| ResolvedVariant {
                source_factory: bound_at,
                index,
                tag: binding.tag.clone(),
                envs: self.chain_envs(factory, binding.env.clone()),
                params: binding.params.clone(),
                repeat_each: binding.repeat_each,
            })
            .collect()
    }

    /// Envs from `factory` up to the root, most-derived first, with the
    /// binding env (if any) innermost.
    fn chain_envs(&self, factory: usize, bound: Option<Arc<dyn Env>>) -> Vec<Arc<dyn Env>> {
        let mut envs = Vec::new();
        let mut cursor = Some(factory);
        while let Some(node) = cursor {
            if let Some(env) = &self.nodes[node].env {
                envs.push(env.clone());
            }
            cursor = self.nodes[node].parent;
        }
        if let Some(env) = bound {
            envs.push(env);
        }
        envs
    }

    pub fn binding_count(&self, factory: usize) -> usize {
        self.bindings.iter().filter(|b| b.factory == factory).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedEnv(&'static str);

    impl Env for NamedEnv {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn unbound_factory_resolves_to_default_variant() {
        let registry = FactoryRegistry::new();
        let variants = registry.resolve_variants(registry.root());
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].tag, "");
        assert!(variants[0].envs.is_empty());
    }

    #[test]
    fn bindings_produce_one_variant_each() {
        let mut registry = FactoryRegistry::new();
        registry.bind(
            0,
            Some(Arc::new(NamedEnv("chromium"))),
            RunWithOptions::default(),
        );
        registry.bind(
            0,
            Some(Arc::new(NamedEnv("webkit"))),
            RunWithOptions::tagged("wk"),
        );
        let variants = registry.resolve_variants(0);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].tag, "chromium");
        assert_eq!(variants[1].tag, "wk");
    }

    #[test]
    fn derived_factory_inherits_ancestor_bindings() {
        let mut registry = FactoryRegistry::new();
        registry.bind(0, Some(Arc::new(NamedEnv("base"))), RunWithOptions::default());
        let derived = registry.extend(0, Arc::new(NamedEnv("derived")));
        let variants = registry.resolve_variants(derived);
        assert_eq!(variants.len(), 1);
        let names: Vec<_> = variants[0].envs.iter().map(|e| e.name()).collect();
        // Most-derived first, binding env innermost.
        assert_eq!(names, vec!["derived", "base"]);
    }

    #[test]
    fn own_bindings_shadow_ancestor_bindings() {
        let mut registry = FactoryRegistry::new();
        registry.bind(0, Some(Arc::new(NamedEnv("base"))), RunWithOptions::default());
        let derived = registry.declare(0);
        registry.bind(
            derived,
            Some(Arc::new(NamedEnv("own"))),
            RunWithOptions::default(),
        );
        let variants = registry.resolve_variants(derived);
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].tag, "own");
    }

    #[test]
    fn repeat_each_carried_per_binding() {
        let mut registry = FactoryRegistry::new();
        registry.bind(
            0,
            None,
            RunWithOptions::default().with_repeat_each(3),
        );
        let variants = registry.resolve_variants(0);
        assert_eq!(variants[0].repeat_each, Some(3));
    }
}
