use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::owner::OwnerId;

/// How to launch a worker process
/// Immutable once handed to `start`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfiguration {
    /// Groups workers of the same kind together (e.g. "fileWatcher")
    pub process_type: String,

    /// Entry point the bootstrap module loads inside the worker
    pub entry_point: String,

    /// Sent to the worker as its first message
    pub payload: Option<Value>,

    /// Environment for the worker; defaults to the supervisor's own
    /// Non-string values are coerced to strings, nulls are dropped
    pub env: Option<HashMap<String, Value>>,

    /// Arguments available to the worker
    pub args: Option<Vec<String>>,

    /// Arguments passed to the host executable
    pub exec_args: Option<Vec<String>>,

    pub allow_unsigned_libraries: Option<bool>,

    /// Used in log lines to correlate the worker with other components
    pub correlation_id: Option<String>,

    /// Pid of a parent process the worker should exit with
    pub parent_lifecycle_bound: Option<u32>,

    pub force_sandboxed_heap: Option<bool>,
}

impl WorkerConfiguration {
    pub fn new(process_type: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            entry_point: entry_point.into(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_env<K, V>(mut self, env: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.env = Some(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_exec_args(mut self, exec_args: Vec<String>) -> Self {
        self.exec_args = Some(exec_args);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_parent_lifecycle_bound(mut self, pid: u32) -> Self {
        self.parent_lifecycle_bound = Some(pid);
        self
    }
}

/// Worker configuration for a worker bound to an owner (e.g. a window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerBoundConfiguration {
    #[serde(flatten)]
    pub worker: WorkerConfiguration,

    /// Owner that receives the message port
    pub owner_id: OwnerId,

    /// Channel the owner listens on for the port
    pub response_channel: String,

    /// Nonce echoed back to the owner with the port
    pub response_nonce: String,

    /// Kill the worker when the owner closes or reloads
    #[serde(default)]
    pub owner_lifecycle_bound: bool,
}

impl OwnerBoundConfiguration {
    pub fn new(
        worker: WorkerConfiguration,
        owner_id: OwnerId,
        response_channel: impl Into<String>,
        response_nonce: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            owner_id,
            response_channel: response_channel.into(),
            response_nonce: response_nonce.into(),
            owner_lifecycle_bound: false,
        }
    }

    pub fn lifecycle_bound(mut self) -> Self {
        self.owner_lifecycle_bound = true;
        self
    }
}

/// Configuration variants accepted by a worker handle
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchConfiguration {
    Standalone(WorkerConfiguration),
    OwnerBound(OwnerBoundConfiguration),
}

impl LaunchConfiguration {
    pub fn worker(&self) -> &WorkerConfiguration {
        match self {
            LaunchConfiguration::Standalone(config) => config,
            LaunchConfiguration::OwnerBound(config) => &config.worker,
        }
    }

    /// Name the worker is listed under in the process registry
    pub fn display_name(&self) -> String {
        match self {
            LaunchConfiguration::Standalone(config) => config.process_type.clone(),
            LaunchConfiguration::OwnerBound(config) => {
                format!("{} [{}]", config.worker.process_type, config.owner_id)
            }
        }
    }
}
