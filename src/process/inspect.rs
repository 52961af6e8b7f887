/// Host debugging facility used to open an inspector in a running worker
use tracing::warn;

pub trait InspectFacility: Send + Sync {
    /// Ask the process to open its inspector; false if unsupported or refused
    fn enable(&self, pid: u32) -> bool;
}

/// Sends SIGUSR1, which JS runtimes treat as "start the inspector"
#[derive(Debug, Default)]
pub struct SignalInspector;

impl InspectFacility for SignalInspector {
    #[cfg(unix)]
    fn enable(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };

        // SAFETY: kill(2) has no memory-safety preconditions
        let result = unsafe { libc::kill(pid, libc::SIGUSR1) };
        if result != 0 {
            warn!("Failed to signal PID {} to open its inspector: {}", pid, std::io::Error::last_os_error());
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn enable(&self, _pid: u32) -> bool {
        warn!("Opening an inspector port is not supported on this platform");
        false
    }
}
