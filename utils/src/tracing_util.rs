//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing with the default configuration.
pub fn initialize_tracing(verbose: bool) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose; the terminal output is already sequenced by the pipeline.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let max_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_max_level(max_level)
        .init();
}
