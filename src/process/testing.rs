//! Test doubles for worker supervision
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use super::crash::{CrashTelemetry, TelemetrySink};
use super::host::ProcessHost;
use super::inspect::InspectFacility;
use super::launcher::{ProcessEvent, ProcessLauncher, SpawnOptions, SpawnedProcess, WorkerProcess};
use super::owner::{Owner, OwnerDirectory, OwnerId};
use super::port::MessagePort;
use crate::config::SupervisorConfig;
use crate::error::WorkerError;
use crate::event::Emitter;

/// Let spawned tasks drain their queues on the current-thread test runtime
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn test_host(launcher: &Arc<FakeLauncher>) -> Arc<ProcessHost> {
    host_builder(launcher).build().unwrap()
}

pub(crate) fn test_host_with_owners(launcher: &Arc<FakeLauncher>, owners: &Arc<FakeOwners>) -> Arc<ProcessHost> {
    host_builder(launcher).owners(owners.clone()).build().unwrap()
}

fn host_builder(launcher: &Arc<FakeLauncher>) -> super::host::ProcessHostBuilder {
    ProcessHost::builder(SupervisorConfig::default())
        .launcher(launcher.clone())
        .telemetry(launcher.telemetry.clone())
        .inspector(launcher.inspector.clone())
}

#[derive(Clone)]
pub(crate) struct SpawnRecord {
    pub module: PathBuf,
    pub args: Vec<String>,
    pub options: SpawnOptions,
    pub process: Arc<FakeProcess>,
}

/// Records spawns and hands out scriptable processes
///
/// Also carries the recording sinks that `test_host` wires into the host.
pub(crate) struct FakeLauncher {
    spawns: Mutex<Vec<SpawnRecord>>,
    kill_succeeds: AtomicBool,
    spawn_fails: AtomicBool,
    next_pid: AtomicU32,
    pub telemetry: Arc<RecordingTelemetry>,
    pub inspector: Arc<RecordingInspector>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            spawns: Mutex::new(Vec::new()),
            kill_succeeds: AtomicBool::new(true),
            spawn_fails: AtomicBool::new(false),
            next_pid: AtomicU32::new(4000),
            telemetry: Arc::new(RecordingTelemetry::default()),
            inspector: Arc::new(RecordingInspector::default()),
        })
    }

    pub(crate) fn set_kill_succeeds(&self, succeeds: bool) {
        self.kill_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub(crate) fn set_spawn_fails(&self, fails: bool) {
        self.spawn_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.lock().len()
    }

    pub(crate) fn last_spawn(&self) -> SpawnRecord {
        self.spawns.lock().last().cloned().expect("nothing was spawned")
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<SpawnedProcess, WorkerError> {
        if self.spawn_fails.load(Ordering::SeqCst) {
            return Err(WorkerError::Spawn(io::Error::new(io::ErrorKind::NotFound, "no such executable")));
        }

        let (tx, events) = mpsc::unbounded_channel();
        let process = Arc::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            events: tx,
            kill_succeeds: self.kill_succeeds.load(Ordering::SeqCst),
            kills: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
        });

        self.spawns.lock().push(SpawnRecord {
            module: module.to_path_buf(),
            args: args.to_vec(),
            options,
            process: process.clone(),
        });

        Ok(SpawnedProcess { process, events })
    }
}

/// A process driven entirely by the test through `emit`
pub(crate) struct FakeProcess {
    pub pid: u32,
    events: mpsc::UnboundedSender<ProcessEvent>,
    kill_succeeds: bool,
    kills: AtomicUsize,
    messages: Mutex<Vec<(Value, usize)>>,
    ports: Mutex<Vec<MessagePort>>,
}

impl FakeProcess {
    pub(crate) fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Posted messages with the number of ports transferred alongside each
    pub(crate) fn messages(&self) -> Vec<(Value, usize)> {
        self.messages.lock().clone()
    }

    pub(crate) fn take_ports(&self) -> Vec<MessagePort> {
        std::mem::take(&mut *self.ports.lock())
    }
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn post_message(&self, message: Value, transfer: Vec<MessagePort>) -> Result<(), WorkerError> {
        self.messages.lock().push((message, transfer.len()));
        self.ports.lock().extend(transfer);
        Ok(())
    }

    fn kill(&self) -> bool {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.kill_succeeds
    }
}

#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    records: Mutex<Vec<CrashTelemetry>>,
}

impl RecordingTelemetry {
    pub(crate) fn records(&self) -> Vec<CrashTelemetry> {
        self.records.lock().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn publish_crash(&self, record: CrashTelemetry) {
        self.records.lock().push(record);
    }
}

#[derive(Default)]
pub(crate) struct RecordingInspector {
    requests: Mutex<Vec<u32>>,
}

impl RecordingInspector {
    pub(crate) fn requests(&self) -> Vec<u32> {
        self.requests.lock().clone()
    }
}

impl InspectFacility for RecordingInspector {
    fn enable(&self, pid: u32) -> bool {
        self.requests.lock().push(pid);
        true
    }
}

type Delivery = (String, String, Vec<MessagePort>);

pub(crate) struct FakeOwner {
    id: OwnerId,
    sandboxed: bool,
    destroyed: AtomicBool,
    deliveries: Mutex<Vec<Delivery>>,
    closed: Emitter<()>,
}

impl FakeOwner {
    pub(crate) fn new(id: OwnerId) -> Self {
        Self {
            id,
            sandboxed: false,
            destroyed: AtomicBool::new(false),
            deliveries: Mutex::new(Vec::new()),
            closed: Emitter::new(),
        }
    }

    pub(crate) fn sandboxed(mut self) -> Self {
        self.sandboxed = true;
        self
    }

    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.closed.fire(&());
    }

    /// Takes everything posted to the owner so far
    pub(crate) fn deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

impl Owner for FakeOwner {
    fn id(&self) -> OwnerId {
        self.id
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    fn post_message(&self, channel: &str, nonce: &str, transfer: Vec<MessagePort>) {
        self.deliveries
            .lock()
            .push((channel.to_string(), nonce.to_string(), transfer));
    }

    fn on_closed(&self) -> &Emitter<()> {
        &self.closed
    }
}

#[derive(Default)]
pub(crate) struct FakeOwners {
    owners: Mutex<HashMap<OwnerId, Arc<FakeOwner>>>,
    reload: Emitter<OwnerId>,
}

impl FakeOwners {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add(&self, owner: FakeOwner) -> Arc<FakeOwner> {
        let owner = Arc::new(owner);
        self.owners.lock().insert(owner.id, owner.clone());
        owner
    }

    pub(crate) fn will_reload(&self, id: OwnerId) {
        self.reload.fire(&id);
    }
}

impl OwnerDirectory for FakeOwners {
    fn lookup(&self, id: OwnerId) -> Option<Arc<dyn Owner>> {
        let owner: Arc<dyn Owner> = self.owners.lock().get(&id).cloned()?;
        Some(owner)
    }

    fn on_will_reload(&self) -> &Emitter<OwnerId> {
        &self.reload
    }
}

/// Captures tracing events emitted on the current thread
pub(crate) struct LogCapture {
    lines: Arc<Mutex<Vec<(Level, String)>>>,
    _guard: DefaultGuard,
}

impl LogCapture {
    pub(crate) fn start() -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer { lines: lines.clone() });
        let guard = tracing::subscriber::set_default(subscriber);

        Self { lines, _guard: guard }
    }

    fn has(&self, level: Level, needle: &str) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }

    pub(crate) fn has_error_containing(&self, needle: &str) -> bool {
        self.has(Level::ERROR, needle)
    }

    pub(crate) fn has_warning_containing(&self, needle: &str) -> bool {
        self.has(Level::WARN, needle)
    }

    pub(crate) fn has_info_containing(&self, needle: &str) -> bool {
        self.has(Level::INFO, needle)
    }
}

struct CaptureLayer {
    lines: Arc<Mutex<Vec<(Level, String)>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.lines.lock().push((*event.metadata().level(), visitor.0));
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}
