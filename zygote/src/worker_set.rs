//! Bookkeeping of worker IDs the loader has launched.

use std::collections::HashSet;

use crate::bridge::protocol::WorkerId;

/// Append-only set of launched worker IDs.
///
/// An ID only enters the set after its worker was forked successfully, and
/// it never leaves: the supervisor must not reuse an ID within one loader's
/// lifetime.
#[derive(Debug, Default)]
pub struct WorkerSet {
    launched: HashSet<WorkerId>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.launched.contains(id)
    }

    /// Returns `false` if the ID was already present.
    pub fn insert(&mut self, id: WorkerId) -> bool {
        self.launched.insert(id)
    }

    pub fn len(&self) -> usize {
        self.launched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launched.is_empty()
    }
}
