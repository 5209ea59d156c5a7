//! specrun CLI entry point
//!
//! The standalone binary ships with an empty file registry: it can discover,
//! list, and report, and is mainly useful as a scaffold. Real projects embed
//! the runner and register their test files before calling
//! [`specrun::run_cli`]; see the crate docs.

use specrun::FileRegistry;

#[tokio::main]
async fn main() {
    let code = specrun::run_cli(FileRegistry::new()).await;
    std::process::exit(code);
}
