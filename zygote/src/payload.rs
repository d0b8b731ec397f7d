//! The application code a loader preloads and runs in its workers.

use std::io;
use std::path::Path;

use crate::bridge::protocol::WorkerId;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PayloadError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// What a freshly forked worker knows about itself.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    id: WorkerId,
}

impl WorkerContext {
    pub fn new(id: WorkerId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }
}

/// Application code driven by the loader.
///
/// `load` runs in the loader before it reports ready. The hooks run in the
/// intermediary process of every spawn, and `run` is the worker's whole
/// life: it never returns control to the loader.
pub trait Payload {
    /// Load one preload file into the loader process.
    fn load(&mut self, file: &Path) -> Result<(), PayloadError>;

    /// Reset process-wide state that must differ between workers, such as
    /// random number generator seeds.
    fn after_fork(&self) {}

    /// Compact heap state so that workers share more pages with the loader.
    fn reduce_cow_overhead(&self) {}

    /// The worker entry point.
    ///
    /// A worker that wants to tell the supervisor it finished starting up
    /// calls [`crate::worker_ack::done`] once.
    fn run(&self, ctx: WorkerContext) -> Result<(), PayloadError>;
}
