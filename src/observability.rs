//! Tracing bootstrap for binaries embedding the portal core.

use tracing_subscriber::EnvFilter;

/// Installs the default tracing subscriber: compact output with an
/// env-filter (`RUST_LOG`) falling back to the given directive.
///
/// Embedding binaries call this once at startup; tests install their own
/// subscriber instead.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("bridge_core=debug");
        // A second call must not panic even though a subscriber is set.
        init_tracing("bridge_core=info");
    }
}
