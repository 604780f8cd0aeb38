use tracing_subscriber::EnvFilter;

/// Initialise the process-wide tracing subscriber.
///
/// `quiet` limits output to warnings and errors; otherwise debug-level events
/// are emitted. `RUST_LOG` overrides either default. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging(quiet: bool) {
    let default_directive = if quiet { "warn" } else { "debug" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
