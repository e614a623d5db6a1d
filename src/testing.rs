//! Helpers shared by the crate's tests and benchmarks.

use std::future::Future;

/// Installs a `fmt` subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runs `fut` to completion on a current-thread runtime inside a `LocalSet`.
/// Process tasks only advance when `fut` drives the kernel, usually through
/// `Kernel::run` or `Kernel::run_until`.
pub fn run_local<F: Future>(fut: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, fut)
}
