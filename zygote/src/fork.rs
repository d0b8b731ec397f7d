//! Double-fork worker spawning.
//!
//! A spawn runs in three processes:
//!
//! 1. **caller** (the loader) forks an intermediary and blocks until it exits;
//! 2. **intermediary** prepares the environment, forks the worker, reports
//!    the worker's pid over a pipe and exits without waiting;
//! 3. **worker** runs the payload and never returns to the loader.
//!
//! The worker is orphaned on purpose: it gets reparented to the supervisor
//! (a subreaper) or init, and the loader never has to reap it.
//!
//! ## Safety contracts
//!
//! `fork()` is only sound here because the loader is single-threaded. The
//! intermediary touches the environment and the descriptor table, then calls
//! `_exit` so no destructors or atexit handlers of the loader run twice.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, pipe};

use crate::bridge::protocol::WorkerId;
use crate::env::WorkerEnv;
use crate::payload::{Payload, WorkerContext};

/// Reason reported when the intermediary did not exit cleanly.
pub const NON_ZERO_EXIT: &str = "non-zero exit";

/// Result of one spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// The worker was forked. `pid` is `None` if the intermediary exited
    /// cleanly but its report never arrived.
    Launched { pid: Option<i32> },
    Failed { reason: String },
}

impl SpawnOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Something that can turn a spawn request into a running worker.
pub trait WorkerSpawner<P: Payload> {
    fn spawn(&self, payload: &P, id: &WorkerId) -> SpawnOutcome;
}

/// Environment preparation errors inside the intermediary.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("failed to open /dev/null")]
    DevNull(#[source] io::Error),

    #[error("failed to redirect stdin: {0}")]
    Stdin(Errno),

    #[error("failed to change to worker directory {}", dir.display())]
    WorkerDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The production spawner.
#[derive(Debug, Clone)]
pub struct ForkEngine {
    group: String,
    code_version: String,
    status_fd: RawFd,
    worker_dir: PathBuf,
}

impl ForkEngine {
    pub fn new(group: impl Into<String>, code_version: impl Into<String>, status_fd: RawFd) -> Self {
        Self {
            group: group.into(),
            code_version: code_version.into(),
            status_fd,
            worker_dir: PathBuf::from("/"),
        }
    }

    /// Directory every worker starts in. Defaults to `/` so that workers
    /// do not pin the loader's working directory.
    pub fn with_worker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker_dir = dir.into();
        self
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    /// Caller stage.
    fn await_intermediary(&self, intermediary: Pid, report: OwnedFd) -> SpawnOutcome {
        loop {
            let status = match waitpid(intermediary, None) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                // SIGCHLD ignored: the intermediary was reaped by the kernel,
                // so its report is the only evidence of a launch.
                Err(Errno::ECHILD) => {
                    return match read_worker_pid(report) {
                        Some(pid) => SpawnOutcome::Launched { pid: Some(pid) },
                        None => SpawnOutcome::failed(NON_ZERO_EXIT),
                    };
                }
                Err(e) => {
                    tracing::error!(%intermediary, error = %e, "waitpid failed");
                    return SpawnOutcome::failed(NON_ZERO_EXIT);
                }
            };
            if status.pid() != Some(intermediary) {
                tracing::debug!(?status, %intermediary, "Ignoring wait status of another process");
                continue;
            }
            match intermediary_succeeded(status) {
                Some(true) => {
                    return SpawnOutcome::Launched {
                        pid: read_worker_pid(report),
                    };
                }
                Some(false) => {
                    tracing::warn!(?status, "Intermediary process failed");
                    return SpawnOutcome::failed(NON_ZERO_EXIT);
                }
                None => continue,
            }
        }
    }

    /// Intermediary stage. Never returns.
    fn run_intermediary<P: Payload>(&self, payload: &P, id: &WorkerId, report: OwnedFd) -> ! {
        if let Err(e) = self.prepare(payload, id) {
            tracing::error!(worker_id = %id, error = %e, "Worker environment preparation failed");
            exit_now(1);
        }

        // Safety: still single-threaded, see the module docs.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let mut report = File::from(report);
                if let Err(e) = report.write_all(&child.as_raw().to_ne_bytes()) {
                    tracing::debug!(error = %e, "Could not report worker pid");
                }
                drop(report);
                exit_now(0);
            }
            Ok(ForkResult::Child) => {
                drop(report);
                run_worker(payload, id)
            }
            Err(e) => {
                tracing::error!(worker_id = %id, error = %e, "Second fork failed");
                exit_now(1);
            }
        }
    }

    fn prepare<P: Payload>(&self, payload: &P, id: &WorkerId) -> Result<(), PrepareError> {
        if self.status_fd != 0 {
            redirect_stdin_to_dev_null()?;
        }
        std::env::set_current_dir(&self.worker_dir).map_err(|source| PrepareError::WorkerDir {
            dir: self.worker_dir.clone(),
            source,
        })?;

        let env = WorkerEnv {
            id: id.clone(),
            group: self.group.clone(),
            code_version: self.code_version.clone(),
            status_fd: self.status_fd,
        };
        // Safety: the intermediary is single-threaded.
        unsafe { env.export() };

        payload.after_fork();
        attempt_reduce_cow_overhead(payload);
        Ok(())
    }
}

impl<P: Payload> WorkerSpawner<P> for ForkEngine {
    fn spawn(&self, payload: &P, id: &WorkerId) -> SpawnOutcome {
        let (report_read, report_write) = match pipe() {
            Ok(ends) => ends,
            Err(e) => return SpawnOutcome::failed(format!("pipe failed: {e}")),
        };

        // Safety: the loader is single-threaded, see the module docs.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(report_write);
                self.await_intermediary(child, report_read)
            }
            Ok(ForkResult::Child) => {
                drop(report_read);
                self.run_intermediary(payload, id, report_write)
            }
            Err(e) => SpawnOutcome::failed(format!("fork failed: {e}")),
        }
    }
}

/// Worker stage.
fn run_worker<P: Payload>(payload: &P, id: &WorkerId) -> ! {
    match payload.run(WorkerContext::new(id.clone())) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(worker_id = %id, error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}

/// Terminate without running destructors or atexit handlers.
fn exit_now(code: i32) -> ! {
    // Safety: _exit never returns and touches no shared state.
    unsafe { libc::_exit(code) }
}

/// Restore the default SIGCHLD disposition.
///
/// An ignored SIGCHLD survives `execve`, and with it the kernel reaps the
/// intermediary before the loader can collect its exit status.
pub fn reset_child_signal() -> nix::Result<()> {
    // Safety: SigDfl installs no handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }.map(drop)
}

/// `Some(true)` for a clean exit, `Some(false)` for a failed one, `None` if
/// the status does not describe a terminated process.
fn intermediary_succeeded(status: WaitStatus) -> Option<bool> {
    match status {
        WaitStatus::Exited(_, 0) => Some(true),
        WaitStatus::Exited(_, _) | WaitStatus::Signaled(..) => Some(false),
        _ => None,
    }
}

fn read_worker_pid(report: OwnedFd) -> Option<i32> {
    let mut buf = [0u8; 4];
    match File::from(report).read_exact(&mut buf) {
        Ok(()) => Some(i32::from_ne_bytes(buf)),
        Err(e) => {
            tracing::debug!(error = %e, "Worker pid was not reported");
            None
        }
    }
}

fn redirect_stdin_to_dev_null() -> Result<(), PrepareError> {
    let dev_null = OpenOptions::new()
        .read(true)
        .open("/dev/null")
        .map_err(PrepareError::DevNull)?;

    // Safety: dup2 replaces whatever fd 0 refers to; the OwnedFd is forgotten
    // so it never closes stdin.
    let mut stdin = unsafe { OwnedFd::from_raw_fd(0) };
    let result = dup2(&dev_null, &mut stdin);
    std::mem::forget(stdin);
    result.map_err(PrepareError::Stdin)
}

/// Give the payload a chance to compact its heap, then return freed memory
/// to the kernel where the allocator supports it.
pub fn attempt_reduce_cow_overhead<P: Payload>(payload: &P) {
    payload.reduce_cow_overhead();

    // Safety: malloc_trim only walks allocator state.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    let _ = unsafe { libc::malloc_trim(0) };
}
