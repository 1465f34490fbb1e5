use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber driven by `RUST_LOG`, falling back to `default_directive`.
///
/// Events go to stderr so stdout stays free for query output.
///
/// Returns false when a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Label attached to per-worker log events; absent or empty labels render as `-`.
pub(crate) fn worker(label: Option<&str>) -> &str {
    match label {
        Some(l) if !l.is_empty() => l,
        _ => "-",
    }
}
