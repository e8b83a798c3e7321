//! YAML state files: `<dir>/<stack>/state.yaml`.
//!
//! Every read-modify-write runs under an exclusive `fs2` lock on
//! `<dir>/<stack>/.lock`, and files are replaced atomically (temp file +
//! rename), so concurrent processes never observe a torn document.

use super::{ApplyLease, StateStore};
use crate::core::error::StateError;
use crate::core::types::{DeployedRecord, StackState};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// File-backed state store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

/// Holds the stack's advisory lock until dropped.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a stack's state document.
    pub fn state_path(&self, stack: &str) -> PathBuf {
        self.dir.join(stack).join("state.yaml")
    }

    fn lock(&self, stack: &str) -> Result<LockGuard, StateError> {
        let stack_dir = self.dir.join(stack);
        fs::create_dir_all(&stack_dir)?;
        let path = stack_dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        FileExt::lock_exclusive(&file)
            .map_err(|_| StateError::Lock { path: path.clone() })?;
        Ok(LockGuard { file })
    }

    fn read(&self, stack: &str) -> Result<StackState, StateError> {
        let path = self.state_path(stack);
        if !path.exists() {
            return Ok(StackState::empty(stack));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_yaml_ng::from_str(&content)?)
    }

    fn write(&self, state: &StackState) -> Result<(), StateError> {
        let path = self.state_path(&state.stack);
        let yaml = serde_yaml_ng::to_string(state)?;
        let tmp_path = path.with_extension("yaml.tmp");
        fs::write(&tmp_path, yaml)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Locked read-modify-write of one stack document.
    fn update<T>(
        &self,
        stack: &str,
        f: impl FnOnce(&mut StackState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let _guard = self.lock(stack)?;
        let mut state = self.read(stack)?;
        let out = f(&mut state)?;
        self.write(&state)?;
        Ok(out)
    }
}

impl StateStore for FileStateStore {
    fn load(&self, stack: &str) -> Result<StackState, StateError> {
        let _guard = self.lock(stack)?;
        self.read(stack)
    }

    fn begin_apply(&self, stack: &str, expected_version: u64) -> Result<ApplyLease, StateError> {
        self.update(stack, |s| s.acquire(expected_version))
    }

    fn put_record(&self, lease: &mut ApplyLease, record: &DeployedRecord) -> Result<(), StateError> {
        let stack = lease.stack.clone();
        self.update(&stack, |s| s.commit_put(lease, record))
    }

    fn remove_record(&self, lease: &mut ApplyLease, logical_id: &str) -> Result<(), StateError> {
        let stack = lease.stack.clone();
        self.update(&stack, |s| s.commit_remove(lease, logical_id))
    }

    fn finish_apply(&self, lease: ApplyLease) -> Result<(), StateError> {
        self.update(&lease.stack, |s| s.release(&lease))
    }

    fn force_unlock(&self, stack: &str) -> Result<(), StateError> {
        tracing::warn!(stack, "force-unlocking state");
        self.update(stack, |s| {
            s.lease = None;
            Ok(())
        })
    }
}
