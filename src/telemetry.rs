//! `tracing` + `tracing-subscriber` initialization.
//!
//! Grounded on the teacher's use of `tracing::instrument` throughout
//! `node.rs`; the teacher never wired up a subscriber, so this is built
//! fresh from `tracing-subscriber`'s documented `EnvFilter` pattern
//! (already a Cargo.toml dependency via the `env-filter` feature).

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading `RUST_LOG`, defaulting
/// to `info` when unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
