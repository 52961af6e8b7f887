/// tokio::process backed spawn capability
///
/// Runs `<program> <exec args> <module> <args>` with exactly the environment
/// built for the worker. Output is forwarded as raw chunks; abnormal
/// terminations are reported on the host crash channel before the exit
/// notification so that supervisors see the classified reason first.
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::crash::{classify_exit, exit_code, ChildProcessGone, CrashNotifications, CrashReason};
use super::launcher::{ProcessEvent, ProcessLauncher, SpawnOptions, SpawnedProcess, StdioMode, WorkerProcess};
use super::port::MessagePort;
use crate::error::WorkerError;

const READ_CHUNK_SIZE: usize = 8192;

pub struct CommandLauncher {
    program: PathBuf,
    crashes: CrashNotifications,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, crashes: CrashNotifications) -> Self {
        Self {
            program: program.into(),
            crashes,
        }
    }

    fn command(&self, module: &Path, args: &[String], options: &SpawnOptions) -> Command {
        let mut cmd = Command::new(&self.program);

        // On Windows, hide the console window to prevent flashing
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let (stdout, stderr) = match options.stdio {
            StdioMode::Pipe => (Stdio::piped(), Stdio::piped()),
            StdioMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
            StdioMode::Ignore => (Stdio::null(), Stdio::null()),
        };

        cmd.args(&options.exec_args)
            .arg(module)
            .args(args)
            .env_clear()
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        if options.allow_unsigned_libraries || options.force_sandboxed_heap {
            debug!(
                "{}: unsigned-library and sandboxed-heap options are host specific and not applied",
                options.service_name
            );
        }

        cmd
    }
}

impl ProcessLauncher for CommandLauncher {
    fn spawn(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<SpawnedProcess, WorkerError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let child = match self.command(module, args, &options).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch {:?} for {}: {}", self.program, options.service_name, e);
                let code = e.raw_os_error().unwrap_or(-1);
                self.crashes.publish(ChildProcessGone::utility(
                    options.service_name,
                    code,
                    CrashReason::LaunchFailed,
                ));

                // Dropping both senders ends the event stream right away
                return Ok(SpawnedProcess {
                    process: Arc::new(CommandProcess {
                        pid: None,
                        reaped: Arc::new(AtomicBool::new(true)),
                        kill_tx,
                    }),
                    events,
                });
            }
        };

        let pid = child.id();
        info!("Spawned {} with PID: {:?}", options.service_name, pid);
        let _ = events_tx.send(ProcessEvent::Spawned);

        let reaped = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise_child(
            child,
            events_tx,
            kill_rx,
            reaped.clone(),
            self.crashes.clone(),
            options.service_name,
        ));

        Ok(SpawnedProcess {
            process: Arc::new(CommandProcess { pid, reaped, kill_tx }),
            events,
        })
    }
}

struct CommandProcess {
    pid: Option<u32>,
    /// Set once the supervising task has collected the exit status; the pid
    /// may be reused after that
    reaped: Arc<AtomicBool>,
    /// Only used where the child cannot be signalled directly
    #[cfg_attr(unix, allow(dead_code))]
    kill_tx: mpsc::UnboundedSender<()>,
}

impl CommandProcess {
    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };

        // SAFETY: kill(2) has no memory-safety preconditions
        if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
            warn!("Failed to send kill signal to PID {}: {}", pid, std::io::Error::last_os_error());
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> bool {
        self.kill_tx.send(()).is_ok()
    }
}

impl WorkerProcess for CommandProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn post_message(&self, _message: Value, _transfer: Vec<MessagePort>) -> Result<(), WorkerError> {
        Err(WorkerError::Unsupported("message passing needs a host-provided transport"))
    }

    /// Signals the child right away; false once it has been reaped
    fn kill(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if self.reaped.load(Ordering::SeqCst) {
            return false;
        }
        self.terminate(pid)
    }
}

/// Owns the child until it exits: forwards output, honors kill requests and
/// reports the final status
async fn supervise_child(
    mut child: Child,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    reaped: Arc<AtomicBool>,
    crashes: CrashNotifications,
    service_name: String,
) {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_output(out, events.clone(), ProcessEvent::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_output(err, events.clone(), ProcessEvent::Stderr)));

    let mut kill_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if kill_open => match request {
                Some(()) => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to send kill signal to {}: {}", service_name, e);
                    }
                }
                None => kill_open = false,
            },
        }
    };
    reaped.store(true, Ordering::SeqCst);
    drop(kill_rx);

    // All output must be delivered before the exit notification
    for reader in [stdout, stderr].into_iter().flatten() {
        let _ = reader.await;
    }

    match status {
        Ok(status) => {
            let code = exit_code(status);
            if let Some(reason) = classify_exit(status) {
                debug!("{} ended with code {} ({})", service_name, code, reason);
                crashes.publish(ChildProcessGone::utility(service_name, code, reason));
            }
            let _ = events.send(ProcessEvent::Exit(code));
        }
        Err(e) => {
            error!("Error waiting for {}: {}", service_name, e);
            crashes.publish(ChildProcessGone::utility(service_name, -1, CrashReason::Crashed));
        }
    }
}

async fn forward_output<R>(mut reader: R, events: mpsc::UnboundedSender<ProcessEvent>, wrap: fn(Vec<u8>) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        }
    }
}
