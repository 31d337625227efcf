use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "keyword_aggregator=info,worker=info";

/// Resolve the effective filter: explicit flag, then `RUST_LOG`, then the default.
pub fn build_filter(explicit: Option<&str>) -> EnvFilter {
    if let Some(f) = explicit.filter(|f| !f.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(f) {
            return filter;
        }
        eprintln!("Ignoring invalid log filter {f:?}");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean for
/// JSON output. Safe to call more than once; later calls are ignored.
pub fn init(explicit: Option<&str>, ansi: bool) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(true);
    let _ = tracing_subscriber::registry()
        .with(build_filter(explicit))
        .with(layer)
        .try_init();
}
