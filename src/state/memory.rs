//! In-process state store.

use super::{ApplyLease, StateStore};
use crate::core::error::StateError;
use crate::core::types::{DeployedRecord, StackState};
use rustc_hash::FxHashMap;
use std::sync::{Mutex, PoisonError};

/// State held in memory; lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    stacks: Mutex<FxHashMap<String, StackState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stack<T>(
        &self,
        stack: &str,
        f: impl FnOnce(&mut StackState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        let state = stacks
            .entry(stack.to_string())
            .or_insert_with(|| StackState::empty(stack));
        f(state)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, stack: &str) -> Result<StackState, StateError> {
        let stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(stacks
            .get(stack)
            .cloned()
            .unwrap_or_else(|| StackState::empty(stack)))
    }

    fn begin_apply(&self, stack: &str, expected_version: u64) -> Result<ApplyLease, StateError> {
        self.with_stack(stack, |s| s.acquire(expected_version))
    }

    fn put_record(&self, lease: &mut ApplyLease, record: &DeployedRecord) -> Result<(), StateError> {
        let stack = lease.stack.clone();
        self.with_stack(&stack, |s| s.commit_put(lease, record))
    }

    fn remove_record(&self, lease: &mut ApplyLease, logical_id: &str) -> Result<(), StateError> {
        let stack = lease.stack.clone();
        self.with_stack(&stack, |s| s.commit_remove(lease, logical_id))
    }

    fn finish_apply(&self, lease: ApplyLease) -> Result<(), StateError> {
        self.with_stack(&lease.stack, |s| s.release(&lease))
    }

    fn force_unlock(&self, stack: &str) -> Result<(), StateError> {
        self.with_stack(stack, |s| {
            s.lease = None;
            Ok(())
        })
    }
}
