/// Worker process supervision
///
/// A `ProcessHost` holds the shared context (registry, crash channel, spawn
/// capability); `WorkerHandle` and `OwnerBoundWorkerHandle` each supervise
/// one worker process on top of it.
pub mod command;
pub mod configuration;
pub mod crash;
pub mod decoder;
pub mod environment;
pub mod host;
pub mod inspect;
pub mod launcher;
pub mod owner;
pub mod port;
pub mod registry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use command::CommandLauncher;
pub use configuration::{LaunchConfiguration, OwnerBoundConfiguration, WorkerConfiguration};
pub use crash::{
    ChildProcessGone, CrashNotifications, CrashReason, CrashTelemetry, ProcessKind, TelemetrySink, TracingTelemetry,
};
pub use environment::{DefaultDenyList, DenyList, EnvironmentBuilder};
pub use host::{ProcessHost, ProcessHostBuilder};
pub use inspect::{InspectFacility, SignalInspector};
pub use launcher::{ProcessEvent, ProcessLauncher, SpawnOptions, SpawnedProcess, StdioMode, WorkerProcess};
pub use owner::{Owner, OwnerBoundWorkerHandle, OwnerDirectory, OwnerId};
pub use port::{MessageChannel, MessagePort};
pub use registry::{ProcessInfo, ProcessRegistry};
pub use worker::{CrashEvent, ExitEvent, ExitSignal, Lifecycle, WorkerEvents, WorkerHandle};
