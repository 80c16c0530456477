//! Shared ambient-stack helpers for the workspace's binaries.
//!
//! Mirrors how `qarax-node`'s `main.rs` wires up `tracing`, but centralizes it
//! so every binary (the orchestrator CLI and the guest agent) logs the same
//! way instead of repeating the subscriber setup.

use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize process-wide tracing.
///
/// `name` tags every emitted record (the bunyan `name` field) so logs from
/// the orchestrator and the guest agent can be told apart once aggregated.
/// Honors `RUST_LOG`, defaulting to `info` when unset.
pub fn init_tracing(name: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("VMCORE_LOG_JSON").is_ok() {
        let formatting_layer = BunyanFormattingLayer::new(name.to_string(), std::io::stdout);
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonStorageLayer)
            .with(formatting_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init();
    }
}
