//! The loader: preload, report ready, then spawn workers on command.
//!
//! ```text
//! load_entrypoint* ──► repl: ready ──► read ──► dispatch ──► reply ─┐
//!                                       ▲                          │
//!                                       └──────────────────────────┘
//! ```
//!
//! Everything happens on one thread with blocking I/O; replies are written in
//! the order commands arrive.

use std::path::{Path, PathBuf};

use nix::unistd::{Pid, setpgid};

use crate::bridge::channel::{ChannelError, StatusChannel};
use crate::bridge::protocol::{Command, Reply, WorkerId};
use crate::fork::{
    ForkEngine, SpawnOutcome, WorkerSpawner, attempt_reduce_cow_overhead, reset_child_signal,
};
use crate::payload::{Payload, PayloadError};
use crate::worker_set::WorkerSet;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("loading {}", file.display())]
    Load {
        file: PathBuf,
        #[source]
        source: PayloadError,
    },
}

pub struct Loader<P, S = ForkEngine> {
    payload: P,
    spawner: S,
    channel: StatusChannel,
    workers: WorkerSet,
    own_process_group: bool,
}

impl<P, S> Loader<P, S>
where
    P: Payload,
    S: WorkerSpawner<P>,
{
    pub fn new(payload: P, spawner: S, channel: StatusChannel) -> Self {
        Self {
            payload,
            spawner,
            channel,
            workers: WorkerSet::new(),
            own_process_group: true,
        }
    }

    /// Whether [`Loader::repl`] makes the loader a process-group leader.
    pub fn with_own_process_group(mut self, enabled: bool) -> Self {
        self.own_process_group = enabled;
        self
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    /// Load one preload file into the loader.
    ///
    /// The supervisor sees `loading` before the payload is touched, and an
    /// `error` reply if loading fails.
    pub fn load_entrypoint(&mut self, file: &Path) -> Result<(), LoaderError> {
        self.channel.send(&Reply::Loading {
            file: file.to_path_buf(),
        })?;
        tracing::info!(file = %file.display(), "Loading");

        if let Err(source) = self.payload.load(file) {
            let err = LoaderError::Load {
                file: file.to_path_buf(),
                source,
            };
            self.channel.send(&Reply::Error {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(ToString::to_string),
            })?;
            return Err(err);
        }

        attempt_reduce_cow_overhead(&self.payload);
        Ok(())
    }

    /// Report ready and serve spawn commands until the supervisor closes the
    /// channel.
    pub fn repl(mut self) -> Result<(), LoaderError> {
        self.channel.send(&Reply::Ready)?;
        if let Err(e) = reset_child_signal() {
            tracing::warn!(error = %e, "Could not restore default SIGCHLD handling");
        }
        if self.own_process_group
            && let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0))
        {
            tracing::warn!(error = %e, "Could not become process group leader");
        }
        tracing::info!(fd = self.channel.fd(), "Ready");

        while let Some(command) = self.channel.read_command()? {
            let reply = self.dispatch(command);
            self.channel.send(&reply)?;
        }

        tracing::info!(workers = self.workers.len(), "Status channel closed, shutting down");
        Ok(())
    }

    fn dispatch(&mut self, command: Command) -> Reply {
        match command {
            Command::Spawn { id } => self.spawn(id),
            Command::ParseError { raw_line, cause } => {
                tracing::warn!(%raw_line, %cause, "Unparseable command");
                Reply::Error {
                    message: "in command processing".to_string(),
                    cause: Some(cause),
                }
            }
        }
    }

    fn spawn(&mut self, id: WorkerId) -> Reply {
        if self.workers.contains(&id) {
            tracing::warn!(worker_id = %id, "Refusing to reuse worker ID");
            return Reply::Failed {
                id,
                message: "duplicate ID".to_string(),
            };
        }

        match self.spawner.spawn(&self.payload, &id) {
            SpawnOutcome::Launched { pid } => {
                tracing::info!(worker_id = %id, ?pid, "Worker launched");
                self.workers.insert(id.clone());
                Reply::Launched { id, pid }
            }
            SpawnOutcome::Failed { reason } => {
                tracing::warn!(worker_id = %id, %reason, "Worker spawn failed");
                Reply::Failed {
                    id,
                    message: reason,
                }
            }
        }
    }
}
