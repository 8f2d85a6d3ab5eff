//! Process-wide structured logging, installed once from the CLI entry point.
//!
//! Simplified relative to a full multi-layer builder (rotation, JSON,
//! `OpenTelemetry`) — this is a single-binary desktop-adjacent tool, not a
//! long-running service, so one `fmt` layer with an env filter is enough.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. Safe to call at most once per
/// process; a second call is a silent no-op (mirrors `tracing_subscriber`'s
/// own `try_init` semantics rather than panicking on double-init).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
