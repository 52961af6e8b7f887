/// Crash classification, host crash notifications and crash telemetry
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::process::ExitStatus;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::info;

/// Telemetry event name for worker crashes
pub const CRASH_TELEMETRY_EVENT: &str = "workerprocesscrash";

/// Why a worker process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashReason {
    CleanExit,
    AbnormalExit,
    Killed,
    Crashed,
    Oom,
    LaunchFailed,
    IntegrityFailure,
}

impl CrashReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashReason::CleanExit => "clean-exit",
            CrashReason::AbnormalExit => "abnormal-exit",
            CrashReason::Killed => "killed",
            CrashReason::Crashed => "crashed",
            CrashReason::Oom => "oom",
            CrashReason::LaunchFailed => "launch-failed",
            CrashReason::IntegrityFailure => "integrity-failure",
        }
    }
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrashReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean-exit" => Ok(CrashReason::CleanExit),
            "abnormal-exit" => Ok(CrashReason::AbnormalExit),
            "killed" => Ok(CrashReason::Killed),
            "crashed" => Ok(CrashReason::Crashed),
            "oom" => Ok(CrashReason::Oom),
            "launch-failed" => Ok(CrashReason::LaunchFailed),
            "integrity-failure" => Ok(CrashReason::IntegrityFailure),
            other => Err(format!("Unknown crash reason: {}", other)),
        }
    }
}

/// Kind of child process a host notification is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Utility,
    Renderer,
    Gpu,
    Other(String),
}

/// Host-level notification that a child process is gone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessGone {
    pub kind: ProcessKind,
    pub service_name: Option<String>,
    pub exit_code: i32,
    pub reason: CrashReason,
}

impl ChildProcessGone {
    pub fn utility(service_name: impl Into<String>, exit_code: i32, reason: CrashReason) -> Self {
        Self {
            kind: ProcessKind::Utility,
            service_name: Some(service_name.into()),
            exit_code,
            reason,
        }
    }

    /// Whether this notification is about the worker with the given service name
    pub fn concerns(&self, service_name: &str) -> bool {
        self.kind == ProcessKind::Utility && self.service_name.as_deref() == Some(service_name)
    }
}

/// Process-wide stream of host crash notifications
///
/// Thin wrapper over a broadcast channel: every started worker holds its own
/// receiver and filters by service name. Notifications published while no
/// worker is listening are dropped.
#[derive(Clone, Debug)]
pub struct CrashNotifications {
    tx: broadcast::Sender<ChildProcessGone>,
}

impl CrashNotifications {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: ChildProcessGone) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChildProcessGone> {
        self.tx.subscribe()
    }
}

impl Default for CrashNotifications {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Exit code reported for a finished process
/// Signal terminations follow the shell convention of 128 + signal number
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Classify an exit status into a crash reason
/// A successful exit is not a crash and yields None
pub fn classify_exit(status: ExitStatus) -> Option<CrashReason> {
    if status.success() {
        return None;
    }

    if status.code().is_some() {
        return Some(CrashReason::AbnormalExit);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(classify_signal(signal));
        }
    }

    Some(CrashReason::AbnormalExit)
}

#[cfg(unix)]
fn classify_signal(signal: i32) -> CrashReason {
    match signal {
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGABRT | libc::SIGTRAP
        | libc::SIGSYS => CrashReason::Crashed,
        _ => CrashReason::Killed,
    }
}

/// Structured crash record handed to the telemetry sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrashTelemetry {
    #[serde(rename = "type")]
    pub process_type: String,
    pub reason: CrashReason,
    pub code: i32,
    #[serde(serialize_with = "flag_as_digit")]
    pub sandboxed: bool,
}

fn flag_as_digit<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(if *flag { "1" } else { "0" })
}

/// Receives crash records; fire-and-forget
pub trait TelemetrySink: Send + Sync {
    fn publish_crash(&self, record: CrashTelemetry);
}

/// Default sink: writes crash records to the `telemetry` tracing target
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn publish_crash(&self, record: CrashTelemetry) {
        let payload = serde_json::to_string(&record).unwrap_or_default();
        info!(target: "telemetry", event = CRASH_TELEMETRY_EVENT, "{}", payload);
    }
}
