/// Installs the process-wide `fmt` subscriber, capped at `default_level`
/// (`info` when the name is not a level).
pub fn init(default_level: &str) {
    let level = parse_level(default_level);

    // a subscriber may already be installed; keep it
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

pub(crate) fn parse_level(name: &str) -> tracing::Level {
    match name.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
