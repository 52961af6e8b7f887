/// Spawn capability consumed by worker handles
///
/// A launcher starts an OS process and hands back a control handle plus an
/// ordered stream of notifications about it. Spawning is asynchronous: the
/// pid becomes meaningful once `ProcessEvent::Spawned` has been delivered.
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::port::MessagePort;
use crate::error::WorkerError;

/// How the worker's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    #[default]
    Pipe,
    Inherit,
    Ignore,
}

/// Options for spawning a worker process
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnOptions {
    /// Service name used to correlate host crash notifications
    pub service_name: String,
    pub env: HashMap<String, String>,
    pub exec_args: Vec<String>,
    pub allow_unsigned_libraries: bool,
    pub force_sandboxed_heap: bool,
    pub stdio: StdioMode,
}

/// Notifications about a spawned process, in the order it produced them
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Spawned,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Message(Value),
    Exit(i32),
}

/// Control surface of a spawned process
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn post_message(&self, message: Value, transfer: Vec<MessagePort>) -> Result<(), WorkerError>;

    /// Request termination; true if the request was accepted
    fn kill(&self) -> bool;
}

pub struct SpawnedProcess {
    pub process: Arc<dyn WorkerProcess>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, module: &Path, args: &[String], options: SpawnOptions) -> Result<SpawnedProcess, WorkerError>;
}
