use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingSettings;

/// Installs the process-wide subscriber described by the `[logging]`
/// section. Events go to stderr so a consumer's own output stays clean.
///
/// Does nothing when the embedding application already installed one.
pub fn init(settings: &LoggingSettings) {
    let subscriber = subscriber(settings, std::io::stderr);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global subscriber already set, keeping it");
    }
}

/// Compact formatter without targets that drops events below the configured
/// level. Unknown level names fall back to INFO.
pub fn subscriber<W>(
    settings: &LoggingSettings,
    writer: W,
) -> impl Subscriber + Send + Sync + use<W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(parse_level(&settings.level))
        .with_target(false)
        .with_writer(writer)
        .finish()
}

pub(crate) fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
