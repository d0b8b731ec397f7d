//! Startup acknowledgement sent by a worker to the supervisor.
//!
//! Workers inherit the status descriptor and the environment slots written by
//! the intermediary. Once the application inside the worker considers itself
//! started, it calls [`done`] once; the supervisor then knows the worker is
//! healthy.

use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;

use crate::bridge::channel::ensure_open;
use crate::bridge::codec::encode_reply;
use crate::bridge::protocol::{Reply, WorkerId};
use crate::env::{self, EnvSlot};

/// Send `ack` for this worker over the inherited status descriptor.
///
/// Returns `false` without side effects when the process was not started by
/// a loader (no worker ID, or no usable status descriptor in the
/// environment). On success the worker's copy of the descriptor is closed.
pub fn confirm_loaded() -> bool {
    let Some(id) = EnvSlot::WorkerId.get() else {
        return false;
    };
    let Some(fd) = EnvSlot::StatusFd.get().and_then(|fd| fd.parse().ok()) else {
        return false;
    };
    if let Err(e) = ensure_open(fd) {
        tracing::debug!(fd, error = %e, "Status descriptor unavailable");
        return false;
    }

    let line = match encode_reply(&Reply::Ack {
        id: WorkerId::new(id),
    }) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode ack");
            return false;
        }
    };

    // Safety: the descriptor is open and this worker owns its copy of it;
    // dropping the file closes it, which is the only close it will see.
    let mut status = unsafe { File::from_raw_fd(fd) };
    if let Err(e) = status.write_all(&line) {
        tracing::warn!(fd, error = %e, "Failed to write ack");
        return false;
    }
    true
}

/// [`confirm_loaded`], then clear the worker environment on success.
///
/// # Safety
///
/// Mutates the process environment: no other thread may read or write it
/// concurrently.
pub unsafe fn done() -> bool {
    if !confirm_loaded() {
        return false;
    }
    unsafe { env::clear() };
    true
}
