use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize structured logging for the CLI process.
///
/// Diagnostics go to stderr so operator-facing output on stdout stays clean.
/// `RUNEBOOK_LOG` selects the level (default `info`).
pub fn init() {
    let level = match std::env::var("RUNEBOOK_LOG").ok().as_deref() {
        Some("trace") => Level::TRACE,
        Some("debug") => Level::DEBUG,
        Some("warn") => Level::WARN,
        Some("error") => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Ignore err if already set
}
