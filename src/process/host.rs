/// Shared supervision context
///
/// One `ProcessHost` is created per supervisor and handed to every worker
/// handle. It owns the process registry, the crash notification channel and
/// the capabilities workers are started with.
use anyhow::Result;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

use super::command::CommandLauncher;
use super::crash::{CrashNotifications, TelemetrySink, TracingTelemetry};
use super::environment::{DefaultDenyList, DenyList, EnvironmentBuilder};
use super::inspect::{InspectFacility, SignalInspector};
use super::launcher::ProcessLauncher;
use super::owner::OwnerDirectory;
use super::registry::{ProcessInfo, ProcessRegistry};
use super::worker::WorkerInner;
use crate::config::SupervisorConfig;

pub struct ProcessHost {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    launcher: Arc<dyn ProcessLauncher>,
    crashes: CrashNotifications,
    telemetry: Arc<dyn TelemetrySink>,
    inspector: Arc<dyn InspectFacility>,
    environment: EnvironmentBuilder,
    owners: Option<Arc<dyn OwnerDirectory>>,
    next_handle_id: AtomicU64,
    live: DashMap<u64, Weak<WorkerInner>>,
}

impl ProcessHost {
    pub fn builder(config: SupervisorConfig) -> ProcessHostBuilder {
        ProcessHostBuilder::new(config)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Snapshot of all running workers
    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.registry.list()
    }

    pub fn crash_notifications(&self) -> &CrashNotifications {
        &self.crashes
    }

    /// Number of worker handles that have not been disposed
    pub fn worker_count(&self) -> usize {
        self.live.len()
    }

    /// Wait for every live worker to exit, killing those that outlast `max_wait`
    pub async fn shutdown(&self, max_wait: Duration) {
        let workers: Vec<Arc<WorkerInner>> = self.live.iter().filter_map(|entry| entry.value().upgrade()).collect();
        info!("Waiting for {} worker handles to exit", workers.len());

        join_all(workers.iter().map(|worker| worker.wait_for_exit(max_wait))).await;

        info!("Worker shutdown complete, {} processes still registered", self.registry.len());
    }

    pub(crate) fn launcher(&self) -> &dyn ProcessLauncher {
        self.launcher.as_ref()
    }

    pub(crate) fn telemetry(&self) -> &dyn TelemetrySink {
        self.telemetry.as_ref()
    }

    pub(crate) fn inspector(&self) -> &dyn InspectFacility {
        self.inspector.as_ref()
    }

    pub(crate) fn environment(&self) -> &EnvironmentBuilder {
        &self.environment
    }

    pub(crate) fn owners(&self) -> Option<&Arc<dyn OwnerDirectory>> {
        self.owners.as_ref()
    }

    pub(crate) fn bootstrap_module(&self) -> &Path {
        &self.config.bootstrap_module
    }

    pub(crate) fn next_handle_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn track(&self, id: u64, worker: Weak<WorkerInner>) {
        self.live.insert(id, worker);
    }

    pub(crate) fn forget(&self, id: u64) {
        self.live.remove(&id);
    }
}

/// Assembles a `ProcessHost`
///
/// Anything not supplied falls back to the real implementation. A custom
/// launcher that reports crashes should be given the same channel through
/// `crash_notifications`.
pub struct ProcessHostBuilder {
    config: SupervisorConfig,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    crashes: Option<CrashNotifications>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    inspector: Option<Arc<dyn InspectFacility>>,
    deny_list: Option<Arc<dyn DenyList>>,
    owners: Option<Arc<dyn OwnerDirectory>>,
}

impl ProcessHostBuilder {
    fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            launcher: None,
            crashes: None,
            telemetry: None,
            inspector: None,
            deny_list: None,
            owners: None,
        }
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn crash_notifications(mut self, crashes: CrashNotifications) -> Self {
        self.crashes = Some(crashes);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn InspectFacility>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn deny_list(mut self, deny_list: Arc<dyn DenyList>) -> Self {
        self.deny_list = Some(deny_list);
        self
    }

    pub fn owners(mut self, owners: Arc<dyn OwnerDirectory>) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Fails only when the default launcher is needed and no host executable
    /// can be found
    pub fn build(self) -> Result<Arc<ProcessHost>> {
        let crashes = self
            .crashes
            .unwrap_or_else(|| CrashNotifications::new(self.config.crash_channel_capacity));

        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => {
                let program = self.config.resolve_executable()?;
                info!("Using worker host executable {:?}", program);
                Arc::new(CommandLauncher::new(program, crashes.clone()))
            }
        };

        let deny_list = self
            .deny_list
            .unwrap_or_else(|| Arc::new(DefaultDenyList::new(self.config.denied_env_keys.clone())));

        Ok(Arc::new(ProcessHost {
            registry: ProcessRegistry::new(),
            launcher,
            crashes,
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry)),
            inspector: self.inspector.unwrap_or_else(|| Arc::new(SignalInspector)),
            environment: EnvironmentBuilder::new(deny_list),
            owners: self.owners,
            next_handle_id: AtomicU64::new(0),
            live: DashMap::new(),
            config: self.config,
        }))
    }
}
