//! Supervised worker processes
//!
//! Spawns helper processes from a host executable, tracks them in a
//! process-wide registry, forwards their output and messages as typed events,
//! detects crashes, and can tie a worker's lifetime to an owner such as a
//! window.

pub mod app;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod process;

pub use app::{APP_NAME, APP_VERSION};
pub use config::SupervisorConfig;
pub use error::WorkerError;
pub use event::{Emitter, Subscription};
pub use process::{
    LaunchConfiguration, Lifecycle, OwnerBoundConfiguration, OwnerBoundWorkerHandle, ProcessHost, WorkerConfiguration,
    WorkerHandle,
};
