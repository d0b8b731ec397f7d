//! Environment slots the loader hands to a freshly forked worker.
//!
//! The environment is the one piece of process state that survives the fork
//! without an explicit handoff. The loader writes exactly these four slots in
//! the intermediary, the worker reads them once while acknowledging, and then
//! clears them before the application looks around.
//!
//! Mutating the environment is only sound while no other thread reads or
//! writes it, which is why the setters are `unsafe`.

use std::os::fd::RawFd;

use crate::bridge::protocol::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvSlot {
    /// The ID the supervisor assigned to the worker.
    WorkerId,
    /// Name of the supervision group.
    Group,
    /// Version string of the loaded code.
    CodeVersion,
    /// Number of the inherited status descriptor.
    StatusFd,
}

impl EnvSlot {
    pub const ALL: [EnvSlot; 4] = [
        EnvSlot::WorkerId,
        EnvSlot::Group,
        EnvSlot::CodeVersion,
        EnvSlot::StatusFd,
    ];

    pub const fn key(self) -> &'static str {
        match self {
            EnvSlot::WorkerId => "ZYGOTE_WORKER_ID",
            EnvSlot::Group => "ZYGOTE_GROUP",
            EnvSlot::CodeVersion => "ZYGOTE_CODE_VERSION",
            EnvSlot::StatusFd => "ZYGOTE_STATUS_FD",
        }
    }

    /// Current value, if set and valid unicode.
    pub fn get(self) -> Option<String> {
        std::env::var(self.key()).ok()
    }

    /// # Safety
    ///
    /// No other thread may access the process environment concurrently.
    pub unsafe fn set(self, value: &str) {
        unsafe { std::env::set_var(self.key(), value) }
    }

    /// # Safety
    ///
    /// No other thread may access the process environment concurrently.
    pub unsafe fn unset(self) {
        unsafe { std::env::remove_var(self.key()) }
    }
}

/// Everything a worker learns about itself from the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub id: WorkerId,
    pub group: String,
    pub code_version: String,
    pub status_fd: RawFd,
}

impl WorkerEnv {
    /// Write all four slots.
    ///
    /// # Safety
    ///
    /// No other thread may access the process environment concurrently.
    pub unsafe fn export(&self) {
        unsafe {
            EnvSlot::WorkerId.set(self.id.as_str());
            EnvSlot::Group.set(&self.group);
            EnvSlot::CodeVersion.set(&self.code_version);
            EnvSlot::StatusFd.set(&self.status_fd.to_string());
        }
    }
}

/// Remove every slot. Idempotent.
///
/// # Safety
///
/// No other thread may access the process environment concurrently.
pub unsafe fn clear() {
    for slot in EnvSlot::ALL {
        unsafe { slot.unset() };
    }
}
