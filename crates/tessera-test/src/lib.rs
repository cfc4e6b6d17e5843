//! Test helpers for the Tessera crates.
//!
//! Provides scratch directories that clean up after themselves, deterministic
//! payload fixtures, and a tracing subscriber that writes through the test
//! harness so log output only shows for failing tests.

pub mod fixtures;

pub use fixtures::{payload, TempDir};

use std::sync::Once;

/// Install a `tracing` subscriber for tests. Safe to call from every test.
///
/// Honors `RUST_LOG`, defaulting to `debug` for the Tessera crates.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("tessera_region=debug,tessera_world=debug")
        });
        // Another harness may already have installed one.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
