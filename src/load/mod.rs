//! Loading and registration
//!
//! Turns registered file callbacks into the in-memory spec tree. Fixture
//! files bind environment variants; test files declare suites, specs, and
//! hooks through the [`TestApi`] surface.

mod env;
mod files;
mod loader;

pub use env::{Env, EnvFuture, FactoryRegistry, ResolvedVariant, RunWithOptions, VariantBinding};
pub use files::{FileEntry, FileKind, FileRegistry, RegistrationFn};
pub use loader::{LoadError, Loader, RegistrationError, TestApi};

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn hook_from_helper_file_is_rejected() {
        // A callback whose registration source differs from the hook call
        // site models a helper file registering hooks.
        let entry = FileEntry {
            path: Path::new("a.spec.rs").to_path_buf(),
            kind: FileKind::Test,
            callback: Arc::new(|t: &TestApi| {
                t.before_each(|_cx| async { Ok(None) });
            }),
            source: "helpers/setup.rs",
        };
        let loader = Arc::new(Loader::new());
        let result = loader.load_file(&entry);
        match result {
            Err(LoadError::Registration(RegistrationError::HookOutsideTestFile)) => {}
            other => panic!("expected hook violation, got {other:?}"),
        }
    }

    #[test]
    fn violation_messages_are_stable() {
        assert_eq!(
            RegistrationError::HookOutsideTestFile.to_string(),
            "Hook can only be defined in a test file"
        );
        assert_eq!(
            RegistrationError::RegistrationPhaseViolation { api: "test" }.to_string(),
            "test can only be called while a test file is loading"
        );
    }
}
