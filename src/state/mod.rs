//! Versioned deployed-state persistence keyed by (stack, logical id).
//!
//! A stack has one writer at a time: `begin_apply` hands out a lease only
//! when no other lease is held and the stored version matches what the
//! caller planned against. Every record write bumps the version.

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::core::error::StateError;
use crate::core::types::{DeployedRecord, StackState};
use crate::provenance::eventlog::generate_run_id;

/// Proof of exclusive write access to one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyLease {
    pub stack: String,
    pub token: String,
    /// Stack version after the lease holder's latest write
    pub version: u64,
}

/// Durable, versioned store of deployed state records.
pub trait StateStore: Send + Sync {
    /// Load a stack's records. A stack never written loads empty at version 0.
    fn load(&self, stack: &str) -> Result<StackState, StateError>;

    /// Take the stack's write lease.
    ///
    /// Fails with `ConcurrentApply` if a lease is held or the version moved
    /// away from `expected_version`.
    fn begin_apply(&self, stack: &str, expected_version: u64) -> Result<ApplyLease, StateError>;

    /// Insert or replace one record.
    fn put_record(&self, lease: &mut ApplyLease, record: &DeployedRecord) -> Result<(), StateError>;

    /// Remove one record. Removing a missing record still bumps the version.
    fn remove_record(&self, lease: &mut ApplyLease, logical_id: &str) -> Result<(), StateError>;

    /// Release the lease.
    fn finish_apply(&self, lease: ApplyLease) -> Result<(), StateError>;

    /// Clear a lease left behind by a crashed apply.
    fn force_unlock(&self, stack: &str) -> Result<(), StateError>;
}

pub(crate) fn new_lease_token() -> String {
    format!("lease-{}", generate_run_id())
}

/// Lease bookkeeping shared by every backend that holds a whole
/// `StackState` in hand.
impl StackState {
    pub(crate) fn acquire(&mut self, expected_version: u64) -> Result<ApplyLease, StateError> {
        if let Some(ref holder) = self.lease {
            return Err(StateError::ConcurrentApply {
                stack: self.stack.clone(),
                detail: format!("lease held by {}", holder),
            });
        }
        if self.version != expected_version {
            return Err(StateError::ConcurrentApply {
                stack: self.stack.clone(),
                detail: format!(
                    "expected version {}, found {}",
                    expected_version, self.version
                ),
            });
        }
        let token = new_lease_token();
        self.lease = Some(token.clone());
        Ok(ApplyLease {
            stack: self.stack.clone(),
            token,
            version: self.version,
        })
    }

    pub(crate) fn check_lease(&self, lease: &ApplyLease) -> Result<(), StateError> {
        if self.lease.as_deref() != Some(lease.token.as_str()) {
            return Err(StateError::ConcurrentApply {
                stack: self.stack.clone(),
                detail: format!("lease {} is no longer the holder", lease.token),
            });
        }
        Ok(())
    }

    pub(crate) fn commit_put(
        &mut self,
        lease: &mut ApplyLease,
        record: &DeployedRecord,
    ) -> Result<(), StateError> {
        self.check_lease(lease)?;
        self.records
            .insert(record.logical_id.clone(), record.clone());
        self.version += 1;
        lease.version = self.version;
        Ok(())
    }

    pub(crate) fn commit_remove(
        &mut self,
        lease: &mut ApplyLease,
        logical_id: &str,
    ) -> Result<(), StateError> {
        self.check_lease(lease)?;
        self.records.remove(logical_id);
        self.version += 1;
        lease.version = self.version;
        Ok(())
    }

    pub(crate) fn release(&mut self, lease: &ApplyLease) -> Result<(), StateError> {
        self.check_lease(lease)?;
        self.lease = None;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Behavior every backend must share.

    use super::*;
    use crate::core::types::{Outputs, RemovalPolicy, ResourceKind};
    use std::collections::BTreeMap;

    pub fn record(stack: &str, id: &str) -> DeployedRecord {
        DeployedRecord {
            stack: stack.to_string(),
            logical_id: id.to_string(),
            kind: ResourceKind::Bucket,
            provider_id: format!("bucket-{}", id.to_lowercase()),
            property_hash: "blake3:00".to_string(),
            key_hashes: BTreeMap::from([("name".to_string(), "blake3:01".to_string())]),
            outputs: Outputs::from([("arn".to_string(), serde_json::json!("arn:x"))]),
            dependencies: vec!["Vpc".to_string()],
            removal_policy: RemovalPolicy::Retain,
            adopted: true,
            applied_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn check_roundtrip(store: &dyn StateStore) {
        let empty = store.load("todo").unwrap();
        assert_eq!(empty.version, 0);
        assert!(empty.records.is_empty());

        let mut lease = store.begin_apply("todo", 0).unwrap();
        store.put_record(&mut lease, &record("todo", "Bucket")).unwrap();
        store.put_record(&mut lease, &record("todo", "Table")).unwrap();
        store.remove_record(&mut lease, "Table").unwrap();
        assert_eq!(lease.version, 3);
        store.finish_apply(lease).unwrap();

        let state = store.load("todo").unwrap();
        assert_eq!(state.version, 3);
        assert!(state.lease.is_none());
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records["Bucket"], record("todo", "Bucket"));
        assert!(store.load("other").unwrap().records.is_empty());
    }

    pub fn check_exclusion(store: &dyn StateStore) {
        let mut lease = store.begin_apply("todo", 0).unwrap();
        let err = store.begin_apply("todo", 0).unwrap_err();
        assert!(err.is_concurrent_apply());
        store.put_record(&mut lease, &record("todo", "Bucket")).unwrap();
        store.finish_apply(lease).unwrap();

        let stale = store.begin_apply("todo", 0).unwrap_err();
        assert!(stale.is_concurrent_apply());
        assert!(stale.to_string().contains("expected version 0"));
        store.finish_apply(store.begin_apply("todo", 1).unwrap()).unwrap();
    }

    pub fn check_force_unlock(store: &dyn StateStore) {
        let mut abandoned = store.begin_apply("todo", 0).unwrap();
        store.force_unlock("todo").unwrap();
        let mut lease = store.begin_apply("todo", 0).unwrap();
        let err = store
            .put_record(&mut abandoned, &record("todo", "Bucket"))
            .unwrap_err();
        assert!(err.is_concurrent_apply());
        store.put_record(&mut lease, &record("todo", "Bucket")).unwrap();
        store.finish_apply(lease).unwrap();
        assert_eq!(store.load("todo").unwrap().version, 1);
    }
}
