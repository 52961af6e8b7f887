use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Information about a running worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}

/// Registry of every supervised worker that is currently running
///
/// Keyed by pid. An entry exists from the moment a worker reports it has
/// spawned until its handle leaves the running state or is disposed.
/// Cloning is cheap and shares the same table.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<DashMap<u32, ProcessInfo>>, // pid -> ProcessInfo
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawned process
    pub fn insert(&self, info: ProcessInfo) {
        let pid = info.pid;
        if let Some(previous) = self.processes.insert(pid, info) {
            warn!("Replaced stale registry entry '{}' for PID {}", previous.name, pid);
        } else {
            debug!("Registered worker process PID {}", pid);
        }
    }

    /// Unregister a process (called when it exits, crashes or is killed)
    pub fn remove(&self, pid: u32) -> Option<ProcessInfo> {
        let removed = self.processes.remove(&pid).map(|(_, info)| info);
        if removed.is_some() {
            debug!("Unregistered worker process PID {}", pid);
        }
        removed
    }

    pub fn get(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes.get(&pid).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Snapshot of all running processes, in no particular order
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
