/// Logging setup and the severity levels used by worker log lines
use tracing::Level;

/// Severity of a worker log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Initialize tracing for binaries embedding the supervisor
/// Safe to call more than once - later calls are ignored
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init();
}
