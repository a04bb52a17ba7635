//! Mutation fence guarding cache population against concurrent writes.
//!
//! A mutation holds a [`MutationGuard`] for its whole duration. Entering and
//! leaving both advance the organization's epoch. A reader takes a
//! [`FenceToken`] before its store reads and, after writing its result to the
//! cache, asks [`MutationFence::is_stale`]; a stale reader evicts the entry it
//! just wrote. Combined with the mutation's own post-write invalidation this
//! leaves no window in which a pre-write result survives the mutation.
//!
//! Mutations of one organization are additionally serialized through
//! [`MutationFence::serialize`] so each computes its invalidation set from the
//! state it is about to change. Writer locks are dropped once no task holds
//! or waits on them. Epochs are only recorded for organizations that passed
//! validation, since a reader's token must keep comparing against them.

use std::sync::Arc;

use dashmap::DashMap;
use futures::lock::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::OrgId;

#[derive(Debug, Default, Clone, Copy)]
struct FenceState {
    epoch: u64,
    in_flight: usize,
}

/// Per-organization epoch and in-flight mutation counter.
#[derive(Debug, Default, Clone)]
pub(crate) struct MutationFence {
    states: Arc<DashMap<OrgId, FenceState>>,
    writers: Arc<DashMap<OrgId, Arc<AsyncMutex<()>>>>,
}

/// Snapshot taken by a reader before it consults the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FenceToken {
    epoch: u64,
}

impl MutationFence {
    /// Snapshots the organization's epoch.
    pub(crate) fn token(&self, org: &OrgId) -> FenceToken {
        FenceToken {
            epoch: self
                .states
                .get(org)
                .map(|state| state.epoch)
                .unwrap_or_default(),
        }
    }

    /// Returns true if a mutation started, finished, or is still running
    /// since `token` was taken.
    pub(crate) fn is_stale(&self, org: &OrgId, token: FenceToken) -> bool {
        self.states
            .get(org)
            .is_some_and(|state| state.epoch != token.epoch || state.in_flight > 0)
    }

    /// Waits for exclusive write access to `org`.
    pub(crate) async fn serialize(&self, org: &OrgId) -> WriterGuard {
        let lock = self.writers.entry(org.clone()).or_default().clone();
        WriterGuard {
            guard: Some(lock.lock_owned().await),
            fence: self.clone(),
            org: org.clone(),
        }
    }

    /// Marks a mutation as in flight until the returned guard is dropped.
    pub(crate) fn enter(&self, org: &OrgId) -> MutationGuard {
        {
            let mut state = self.states.entry(org.clone()).or_default();
            state.epoch = state.epoch.wrapping_add(1);
            state.in_flight += 1;
        }
        MutationGuard {
            fence: self.clone(),
            org: org.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> (usize, usize) {
        (self.states.len(), self.writers.len())
    }
}

/// Keeps a mutation registered with the fence.
#[derive(Debug)]
pub(crate) struct MutationGuard {
    fence: MutationFence,
    org: OrgId,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if let Some(mut state) = self.fence.states.get_mut(&self.org) {
            state.epoch = state.epoch.wrapping_add(1);
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

/// Exclusive write access to one organization.
pub(crate) struct WriterGuard {
    guard: Option<OwnedMutexGuard<()>>,
    fence: MutationFence,
    org: OrgId,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds the last reference once nobody waits on the lock.
        self.fence
            .writers
            .remove_if(&self.org, |_, lock| Arc::strong_count(lock) == 1);
    }
}
