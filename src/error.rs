use thiserror::Error;

use crate::process::{Lifecycle, OwnerId};

/// Failures surfaced by worker supervision.
///
/// None of these cross the `start` / `kill` / `post_message` boundaries of a
/// worker handle; they are logged there and turned into boolean results.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Cannot start worker process because it is already running")]
    AlreadyRunning,

    #[error("Cannot restart worker process after it reached the {0:?} state")]
    Terminated(Lifecycle),

    #[error("Owner {0} cannot be found or is destroyed")]
    OwnerUnavailable(OwnerId),

    #[error("Unable to kill the process")]
    KillFailed,

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Operation not supported by this launcher: {0}")]
    Unsupported(&'static str),

    #[error("Worker processes must be started from within a tokio runtime")]
    NoRuntime,
}
