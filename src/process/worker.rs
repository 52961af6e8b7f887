/// Supervision of a single worker process
///
/// A `WorkerHandle` owns at most one OS process at a time and walks it through
/// `Idle -> Starting -> Running -> {Exited | Crashed | Killed}`. Once the handle
/// has left `Running` it cannot be started again.
///
/// Every started process gets a pump task that receives the launcher's
/// notifications together with host crash notifications and turns them into
/// typed events, in the order they were produced. Registry entries are added
/// when the process reports it has spawned and removed on the first terminal
/// transition.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::configuration::{LaunchConfiguration, WorkerConfiguration};
use super::crash::{ChildProcessGone, CrashReason, CrashTelemetry};
use super::decoder::Utf8Decoder;
use super::environment::ambient_environment;
use super::host::ProcessHost;
use super::launcher::{ProcessEvent, SpawnOptions, StdioMode, WorkerProcess};
use super::owner::OwnerHandshake;
use super::port::{MessageChannel, MessagePort};
use super::registry::ProcessInfo;
use crate::error::WorkerError;
use crate::event::{Emitter, Subscription};
use crate::logging::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Idle,
    Starting,
    Running,
    Exited,
    Crashed,
    Killed,
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Exited | Lifecycle::Crashed | Lifecycle::Killed)
    }
}

/// Worker processes do not report the terminating signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitSignal {
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    /// Last known pid; None if the process never reported it spawned
    pub pid: Option<u32>,
    pub code: i32,
    pub signal: ExitSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub pid: Option<u32>,
    pub code: i32,
    pub reason: CrashReason,
}

/// Observable streams of a worker handle
#[derive(Default)]
pub struct WorkerEvents {
    pub stdout: Emitter<String>,
    pub stderr: Emitter<String>,
    pub message: Emitter<Value>,
    pub exit: Emitter<ExitEvent>,
    pub crash: Emitter<CrashEvent>,
}

impl WorkerEvents {
    fn clear(&self) {
        self.stdout.clear();
        self.stderr.clear();
        self.message.clear();
        self.exit.clear();
        self.crash.clear();
    }
}

/// Hooks around the base start sequence, selected by configuration variant
pub(crate) trait StartStrategy {
    /// `Some(owner_is_sandboxed)` to proceed, `None` to skip starting
    /// altogether while still reporting success
    fn preflight(&mut self, worker: &Arc<WorkerInner>) -> Option<bool>;

    /// Runs once the process is launched and its events are wired
    fn after_start(&mut self, worker: &Arc<WorkerInner>);
}

struct StandaloneStart {
    payload: Option<Value>,
}

impl StartStrategy for StandaloneStart {
    fn preflight(&mut self, _worker: &Arc<WorkerInner>) -> Option<bool> {
        Some(false)
    }

    fn after_start(&mut self, worker: &Arc<WorkerInner>) {
        if let Some(payload) = self.payload.take() {
            worker.post_message(payload, Vec::new());
        }
    }
}

struct WorkerState {
    process: Option<Arc<dyn WorkerProcess>>,
    pid: Option<u32>,
    configuration: Option<Arc<LaunchConfiguration>>,
    pump: Option<JoinHandle<()>>,
}

/// What the pump needs to recognise and report crashes of its process
struct CrashContext {
    service_name: String,
    process_type: String,
    sandboxed: bool,
}

pub(crate) struct WorkerInner {
    id: u64,
    host: Arc<ProcessHost>,
    state: Mutex<WorkerState>,
    lifecycle: watch::Sender<Lifecycle>,
    events: WorkerEvents,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
}

impl WorkerInner {
    pub(crate) fn host(&self) -> &Arc<ProcessHost> {
        &self.host
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub(crate) fn log(&self, message: &str, severity: Severity) {
        let (correlation_id, process_type, pid) = {
            let state = self.state.lock();
            let worker = state.configuration.as_deref().map(LaunchConfiguration::worker);
            (
                worker.and_then(|w| w.correlation_id.clone()),
                worker.map(|w| w.process_type.clone()).unwrap_or_else(|| "<none>".to_string()),
                state.pid,
            )
        };

        let pid = pid.map(|pid| pid.to_string()).unwrap_or_else(|| "<none>".to_string());
        let line = match correlation_id {
            Some(id) => format!("[WorkerProcess id: {}, type: {}, pid: {}]: {}", id, process_type, pid, message),
            None => format!("[WorkerProcess type: {}, pid: {}]: {}", process_type, pid, message),
        };

        match severity {
            Severity::Error => error!("{}", line),
            Severity::Warning => warn!("{}", line),
            Severity::Info => info!("{}", line),
        }
    }

    /// Keep a subscription alive until the handle is disposed
    pub(crate) fn retain(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    fn launch(self: &Arc<Self>, configuration: LaunchConfiguration) -> bool {
        match configuration {
            LaunchConfiguration::Standalone(config) => {
                let mut strategy = StandaloneStart {
                    payload: config.payload.clone(),
                };
                self.start_with(LaunchConfiguration::Standalone(config), &mut strategy)
            }
            LaunchConfiguration::OwnerBound(config) => {
                let mut strategy = OwnerHandshake::new(config.clone());
                self.start_with(LaunchConfiguration::OwnerBound(config), &mut strategy)
            }
        }
    }

    fn start_with(self: &Arc<Self>, configuration: LaunchConfiguration, strategy: &mut dyn StartStrategy) -> bool {
        let Some(owner_is_sandboxed) = strategy.preflight(self) else {
            return true;
        };

        if !self.do_start(configuration, owner_is_sandboxed) {
            return false;
        }

        strategy.after_start(self);
        true
    }

    fn can_start(&self, state: &WorkerState) -> Result<(), WorkerError> {
        let lifecycle = self.lifecycle();
        if state.process.is_some() || matches!(lifecycle, Lifecycle::Starting | Lifecycle::Running) {
            return Err(WorkerError::AlreadyRunning);
        }
        if lifecycle.is_terminal() {
            return Err(WorkerError::Terminated(lifecycle));
        }
        Ok(())
    }

    fn do_start(self: &Arc<Self>, configuration: LaunchConfiguration, owner_is_sandboxed: bool) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.log(&WorkerError::NoRuntime.to_string(), Severity::Error);
            return false;
        };

        let configuration = Arc::new(configuration);
        let claimed = {
            let mut state = self.state.lock();
            self.can_start(&state).map(|()| {
                state.configuration = Some(configuration.clone());
                self.lifecycle.send_replace(Lifecycle::Starting);
            })
        };
        if let Err(e) = claimed {
            self.log(&format!("{}...", e), Severity::Error);
            return false;
        }

        let worker = configuration.worker();
        let service_name = service_name(worker, self.id);
        let args = worker.args.clone().unwrap_or_default();
        let options = SpawnOptions {
            service_name: service_name.clone(),
            env: self
                .host
                .environment()
                .build(ambient_environment(), worker, owner_is_sandboxed),
            exec_args: worker.exec_args.clone().unwrap_or_default(),
            allow_unsigned_libraries: worker.allow_unsigned_libraries.unwrap_or(false),
            force_sandboxed_heap: worker.force_sandboxed_heap.unwrap_or(false),
            stdio: StdioMode::Pipe,
        };

        self.log("creating new...", Severity::Info);

        // Subscribe before spawning so no notification about this process is missed
        let crashes = self.host.crash_notifications().subscribe();
        let spawned = match self.host.launcher().spawn(self.host.bootstrap_module(), &args, options) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.log(&format!("failed to launch: {}", e), Severity::Error);
                let mut state = self.state.lock();
                state.configuration = None;
                self.lifecycle.send_replace(Lifecycle::Idle);
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            state.process = Some(spawned.process);
            self.lifecycle.send_replace(Lifecycle::Running);
        }

        let context = CrashContext {
            service_name,
            process_type: worker.process_type.clone(),
            sandboxed: owner_is_sandboxed,
        };
        let pump = runtime.spawn(pump(Arc::downgrade(self), spawned.events, crashes, context));
        self.state.lock().pump = Some(pump);

        true
    }

    fn on_process_event(&self, event: ProcessEvent, stdout: &mut Utf8Decoder, stderr: &mut Utf8Decoder) {
        match event {
            ProcessEvent::Spawned => self.on_spawned(),
            ProcessEvent::Stdout(chunk) => {
                let text = stdout.write(&chunk);
                if !text.is_empty() {
                    self.events.stdout.fire(&text);
                }
            }
            ProcessEvent::Stderr(chunk) => {
                let text = stderr.write(&chunk);
                if !text.is_empty() {
                    self.events.stderr.fire(&text);
                }
            }
            ProcessEvent::Message(message) => self.events.message.fire(&message),
            ProcessEvent::Exit(code) => {
                self.log(&format!("received exit event with code {}", code), Severity::Info);
                let pid = self.on_did_exit_or_crash_or_kill(Lifecycle::Exited);
                self.events.exit.fire(&ExitEvent {
                    pid,
                    code,
                    signal: ExitSignal::Unknown,
                });
            }
        }
    }

    fn on_spawned(&self) {
        let registration = {
            let mut state = self.state.lock();
            if self.lifecycle() != Lifecycle::Running {
                return;
            }
            let Some(pid) = state.process.as_ref().and_then(|process| process.pid()) else {
                return;
            };
            state.pid = Some(pid);
            state
                .configuration
                .as_ref()
                .map(|configuration| ProcessInfo::new(pid, configuration.display_name()))
        };

        if let Some(info) = registration {
            let pid = info.pid;
            self.host.registry().insert(info);
            // A kill may have landed between releasing the lock and the insert
            if self.lifecycle() != Lifecycle::Running {
                self.host.registry().remove(pid);
            }
        }

        self.log("successfully created", Severity::Info);
    }

    fn on_crash(&self, gone: &ChildProcessGone, context: &CrashContext) {
        self.log(
            &format!("crashed with code {} and reason '{}'", gone.exit_code, gone.reason),
            Severity::Error,
        );

        self.host.telemetry().publish_crash(CrashTelemetry {
            process_type: context.process_type.clone(),
            reason: gone.reason,
            code: gone.exit_code,
            sandboxed: context.sandboxed,
        });

        let pid = self.on_did_exit_or_crash_or_kill(Lifecycle::Crashed);
        self.events.crash.fire(&CrashEvent {
            pid,
            code: gone.exit_code,
            reason: gone.reason,
        });
    }

    /// Drop the process and its registry entry; the first terminal state wins
    /// Returns the last known pid
    fn on_did_exit_or_crash_or_kill(&self, terminal: Lifecycle) -> Option<u32> {
        let (pid, released) = {
            let mut state = self.state.lock();
            let released = state.process.take().is_some();
            if released && self.lifecycle() == Lifecycle::Running {
                self.lifecycle.send_replace(terminal);
            }
            (state.pid, released)
        };

        if released {
            if let Some(pid) = pid {
                self.host.registry().remove(pid);
            }
        }
        pid
    }

    fn has_process(&self) -> bool {
        self.state.lock().process.is_some()
    }

    pub(crate) fn post_message(&self, message: Value, transfer: Vec<MessagePort>) {
        let process = self.state.lock().process.clone();
        let Some(process) = process else {
            return; // already killed, crashed or never started
        };

        if let Err(e) = process.post_message(message, transfer) {
            self.log(&format!("failed to post message: {}", e), Severity::Warning);
        }
    }

    pub(crate) fn connect(&self, payload: Option<Value>) -> MessagePort {
        let (outward, worker_port) = MessageChannel::new();
        self.post_message(payload.unwrap_or(Value::Null), vec![worker_port]);
        outward
    }

    fn once<F>(&self, expected: Value, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback = Arc::new(Mutex::new(Some(callback)));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let pending = callback.clone();
        let own_slot = slot.clone();

        let subscription = self.events.message.subscribe(move |message: &Value| {
            if *message != expected {
                return;
            }
            let Some(callback) = pending.lock().take() else {
                return;
            };
            own_slot.lock().take();
            callback();
        });

        // The match may already have fired on another thread; then the
        // subscription is dropped here instead of being parked in the slot
        let mut stored = slot.lock();
        if callback.lock().is_some() {
            *stored = Some(subscription);
        }
    }

    fn enable_inspect_port(&self) -> bool {
        let pid = {
            let state = self.state.lock();
            if state.process.is_none() {
                return false;
            }
            state.pid
        };
        let Some(pid) = pid else {
            return false;
        };

        self.log("enabling inspect port", Severity::Info);
        self.host.inspector().enable(pid)
    }

    pub(crate) fn kill(&self) {
        let process = self.state.lock().process.clone();
        let Some(process) = process else {
            return; // already killed, crashed or never started
        };

        self.log("attempting to kill the process...", Severity::Info);
        if process.kill() {
            self.log("successfully killed the process", Severity::Info);
            self.on_did_exit_or_crash_or_kill(Lifecycle::Killed);
        } else {
            self.log(&WorkerError::KillFailed.to_string(), Severity::Warning);
        }
    }

    pub(crate) async fn wait_for_exit(&self, max_wait: Duration) {
        if !self.has_process() {
            return; // already killed, crashed or never started
        }

        self.log("waiting to exit...", Severity::Info);
        let mut lifecycle = self.lifecycle.subscribe();
        let terminated = async move {
            let _ = lifecycle.wait_for(Lifecycle::is_terminal).await;
        };
        let _ = tokio::time::timeout(max_wait, terminated).await;

        if self.has_process() {
            self.log(
                &format!("did not exit within {}ms, will kill it now...", max_wait.as_millis()),
                Severity::Info,
            );
            self.kill();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (pump, registered) = {
            let mut state = self.state.lock();
            let registered = state.process.as_ref().and(state.pid);
            (state.pump.take(), registered)
        };
        if let Some(pid) = registered {
            self.host.registry().remove(pid);
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        self.events.clear();
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        drop(subscriptions);

        self.host.forget(self.id);
    }
}

fn service_name(worker: &WorkerConfiguration, id: u64) -> String {
    format!("{}-{}", worker.process_type, id)
}

/// Forwards everything the launcher and the host report about one process
async fn pump(
    worker: Weak<WorkerInner>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    mut crashes: broadcast::Receiver<ChildProcessGone>,
    context: CrashContext,
) {
    let mut stdout = Utf8Decoder::new();
    let mut stderr = Utf8Decoder::new();
    let mut crashes_open = true;

    loop {
        tokio::select! {
            biased;
            notification = crashes.recv(), if crashes_open => match notification {
                Ok(gone) => {
                    if gone.concerns(&context.service_name) {
                        let Some(inner) = worker.upgrade() else { return };
                        inner.on_crash(&gone, &context);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{}: skipped {} host crash notifications", context.service_name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => crashes_open = false,
            },
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = worker.upgrade() else { return };
                inner.on_process_event(event, &mut stdout, &mut stderr);
            }
        }
    }

    let Some(inner) = worker.upgrade() else { return };

    let rest = stdout.finish();
    if !rest.is_empty() {
        inner.events.stdout.fire(&rest);
    }
    let rest = stderr.finish();
    if !rest.is_empty() {
        inner.events.stderr.fire(&rest);
    }

    // Notifications published right before the process stream closed
    loop {
        match crashes.try_recv() {
            Ok(gone) => {
                if gone.concerns(&context.service_name) {
                    inner.on_crash(&gone, &context);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Supervises one worker process
///
/// Dropping the handle disposes it: listeners are removed and the registry
/// entry is dropped, but the process itself is left running. Call `kill` or
/// `wait_for_exit` first when the process must go away.
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    /// Create a handle; must be started to spawn anything
    pub fn new(host: &Arc<ProcessHost>) -> Self {
        let inner = Arc::new(WorkerInner {
            id: host.next_handle_id(),
            host: host.clone(),
            state: Mutex::new(WorkerState {
                process: None,
                pid: None,
                configuration: None,
                pump: None,
            }),
            lifecycle: watch::Sender::new(Lifecycle::Idle),
            events: WorkerEvents::default(),
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        host.track(inner.id, Arc::downgrade(&inner));

        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Start a standalone worker
    ///
    /// Returns false if a process is already held or the handle already ran
    /// one. Must be called from within a tokio runtime.
    pub fn start(&self, configuration: WorkerConfiguration) -> bool {
        self.launch(LaunchConfiguration::Standalone(configuration))
    }

    /// Start a worker of either configuration variant
    pub fn launch(&self, configuration: LaunchConfiguration) -> bool {
        self.inner.launch(configuration)
    }

    /// Forward a message to the worker; dropped if there is no process
    pub fn post_message(&self, message: Value, transfer: Vec<MessagePort>) {
        self.inner.post_message(message, transfer);
    }

    /// Open a private channel to the worker
    ///
    /// One end of a fresh port pair is sent to the worker along with
    /// `payload`; the other end is returned.
    pub fn connect(&self, payload: Option<Value>) -> MessagePort {
        self.inner.connect(payload)
    }

    /// Run `callback` the first time the worker sends exactly `expected`
    pub fn once<F>(&self, expected: Value, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.once(expected, callback);
    }

    pub fn enable_inspect_port(&self) -> bool {
        self.inner.enable_inspect_port()
    }

    pub fn kill(&self) {
        self.inner.kill();
    }

    /// Wait up to `max_wait` for the process to go away, then kill it
    pub async fn wait_for_exit(&self, max_wait: Duration) {
        self.inner.wait_for_exit(max_wait).await;
    }

    pub fn on_stdout(&self) -> &Emitter<String> {
        &self.inner.events.stdout
    }

    pub fn on_stderr(&self) -> &Emitter<String> {
        &self.inner.events.stderr
    }

    pub fn on_message(&self) -> &Emitter<Value> {
        &self.inner.events.message
    }

    pub fn on_exit(&self) -> &Emitter<ExitEvent> {
        &self.inner.events.exit
    }

    pub fn on_crash(&self) -> &Emitter<CrashEvent> {
        &self.inner.events.crash
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    /// Last known pid of the worker
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().pid
    }

    /// Whether a process is currently held
    pub fn is_running(&self) -> bool {
        self.inner.has_process()
    }

    /// `<type>-<handle id>` once a configuration has been supplied
    pub fn service_name(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .configuration
            .as_deref()
            .map(|configuration| service_name(configuration.worker(), self.inner.id))
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}
