use tracing_subscriber::{fmt, EnvFilter};

/// Initialise tracing for the sidecar.
///
/// stdout carries the JSON-lines protocol, so log output goes to stderr.
/// `RUST_LOG` overrides the default `info` filter, e.g. `RUST_LOG=knecd=debug`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}

#[cfg(test)]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
