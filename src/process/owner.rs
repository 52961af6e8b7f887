/// Workers bound to an owner such as a window
///
/// The owner receives one end of a private message channel once the worker
/// is up, and may optionally take the worker down with it when it closes or
/// reloads.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::configuration::{LaunchConfiguration, OwnerBoundConfiguration};
use super::host::ProcessHost;
use super::port::MessagePort;
use super::worker::{StartStrategy, WorkerHandle, WorkerInner};
use crate::error::WorkerError;
use crate::event::Emitter;
use crate::logging::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait Owner: Send + Sync {
    fn id(&self) -> OwnerId;

    fn is_destroyed(&self) -> bool;

    /// Sandboxed owners get the sandboxed crash-reporter hint in the worker env
    fn is_sandboxed(&self) -> bool;

    fn post_message(&self, channel: &str, nonce: &str, transfer: Vec<MessagePort>);

    /// Fires once when the owner is closed
    fn on_closed(&self) -> &Emitter<()>;
}

/// Looks up owners by id and reports owner reloads
pub trait OwnerDirectory: Send + Sync {
    fn lookup(&self, id: OwnerId) -> Option<Arc<dyn Owner>>;

    /// Fires with the id of an owner that is about to reload
    fn on_will_reload(&self) -> &Emitter<OwnerId>;
}

/// Start strategy for owner-bound workers
pub(crate) struct OwnerHandshake {
    config: OwnerBoundConfiguration,
    owner: Option<Arc<dyn Owner>>,
    owners: Option<Arc<dyn OwnerDirectory>>,
}

impl OwnerHandshake {
    pub(crate) fn new(config: OwnerBoundConfiguration) -> Self {
        Self {
            config,
            owner: None,
            owners: None,
        }
    }

    fn bind_lifecycle(&self, worker: &Arc<WorkerInner>, owner: &Arc<dyn Owner>) {
        let owner_id = owner.id();

        if let Some(owners) = &self.owners {
            let weak = Arc::downgrade(worker);
            worker.retain(owners.on_will_reload().subscribe(move |reloading: &OwnerId| {
                if *reloading != owner_id {
                    return;
                }
                if let Some(worker) = weak.upgrade() {
                    worker.kill();
                }
            }));
        }

        let weak = Arc::downgrade(worker);
        worker.retain(owner.on_closed().subscribe(move |_: &()| {
            if let Some(worker) = weak.upgrade() {
                worker.kill();
            }
        }));
    }
}

impl StartStrategy for OwnerHandshake {
    fn preflight(&mut self, worker: &Arc<WorkerInner>) -> Option<bool> {
        let owners = worker.host().owners().cloned();
        let owner = owners
            .as_ref()
            .and_then(|owners| owners.lookup(self.config.owner_id))
            .filter(|owner| !owner.is_destroyed());

        let Some(owner) = owner else {
            let reason = WorkerError::OwnerUnavailable(self.config.owner_id);
            worker.log(&format!("Refusing to start worker process: {}", reason), Severity::Error);
            return None;
        };

        let sandboxed = owner.is_sandboxed();
        self.owner = Some(owner);
        self.owners = owners;
        Some(sandboxed)
    }

    fn after_start(&mut self, worker: &Arc<WorkerInner>) {
        let Some(owner) = self.owner.take() else {
            return;
        };

        if self.config.owner_lifecycle_bound {
            self.bind_lifecycle(worker, &owner);
        }

        let port = worker.connect(self.config.worker.payload.clone());
        owner.post_message(&self.config.response_channel, &self.config.response_nonce, vec![port]);
    }
}

/// Worker handle whose worker talks to an owner over a private channel
pub struct OwnerBoundWorkerHandle {
    worker: WorkerHandle,
}

impl OwnerBoundWorkerHandle {
    pub fn new(host: &Arc<ProcessHost>) -> Self {
        Self {
            worker: WorkerHandle::new(host),
        }
    }

    /// Start the worker and hand the owner its end of the channel
    ///
    /// Returns true without spawning anything when the owner is missing or
    /// destroyed; that case is only logged.
    pub fn start(&self, config: OwnerBoundConfiguration) -> bool {
        self.worker.launch(LaunchConfiguration::OwnerBound(config))
    }
}

impl Deref for OwnerBoundWorkerHandle {
    type Target = WorkerHandle;

    fn deref(&self) -> &WorkerHandle {
        &self.worker
    }
}
