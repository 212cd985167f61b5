//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output shape for process logs, selected via `KURA_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line — production default.
    Json,
    /// Compact single-line text, easier to read in a local terminal.
    Plain,
}

impl LogFormat {
    /// `json` (default) or `plain`, case-insensitive; unrecognized values fall back to `Json`.
    pub fn from_env_str(value: &str) -> Self {
        if value.eq_ignore_ascii_case("plain") {
            Self::Plain
        } else {
            Self::Json
        }
    }
}

/// Initialize tracing/logging for the process. Filter comes from
/// `RUST_LOG`/`KURA_LOG_LEVEL` (the latter takes precedence), defaulting to
/// `info`. Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = std::env::var("KURA_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => subscriber.json().with_target(false).try_init(),
        LogFormat::Plain => subscriber.compact().try_init(),
    };
}
