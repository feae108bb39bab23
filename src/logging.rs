use std::io::{self, IsTerminal};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system with environment-based filtering
///
/// - Uses `RUST_LOG` for level filtering (defaults to "info" if not set)
/// - Writes to stderr so command output on stdout stays clean
/// - Emits JSON when stderr is not a terminal, for log shippers
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match default_log_mode() {
        LogMode::Pretty => fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .init(),
        LogMode::Json => fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .json()
            .flatten_event(true)
            .init(),
    }
}

pub fn default_log_mode() -> LogMode {
    if io::stderr().is_terminal() {
        LogMode::Pretty
    } else {
        LogMode::Json
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Pretty,
    Json,
}
