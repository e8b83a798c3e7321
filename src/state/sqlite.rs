//! SQLite state store.
//!
//! One row per stack carries the version and lease; one row per record
//! carries the record body as JSON. Every write runs in an immediate
//! transaction that compare-and-sets on the stack row first.

use super::{new_lease_token, ApplyLease, StateStore};
use crate::core::error::StateError;
use crate::core::types::{DeployedRecord, StackState};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stacks (
    stack   TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 0,
    lease   TEXT
);

CREATE TABLE IF NOT EXISTS records (
    stack         TEXT NOT NULL,
    logical_id    TEXT NOT NULL,
    provider_id   TEXT NOT NULL,
    property_hash TEXT NOT NULL,
    outputs       TEXT NOT NULL,
    body          TEXT NOT NULL,
    PRIMARY KEY (stack, logical_id)
);
";

/// SQLite-backed state store.
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn to_version(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn concurrent(stack: &str, detail: impl Into<String>) -> StateError {
    StateError::ConcurrentApply {
        stack: stack.to_string(),
        detail: detail.into(),
    }
}

impl SqliteStateStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StateError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bump the version of a leased stack inside `tx`, returning the new version.
    fn bump(tx: &rusqlite::Transaction<'_>, lease: &ApplyLease) -> Result<u64, StateError> {
        let changed = tx.execute(
            "UPDATE stacks SET version = version + 1 WHERE stack = ?1 AND lease = ?2",
            params![lease.stack, lease.token],
        )?;
        if changed == 0 {
            return Err(concurrent(
                &lease.stack,
                format!("lease {} is no longer the holder", lease.token),
            ));
        }
        let version: i64 = tx.query_row(
            "SELECT version FROM stacks WHERE stack = ?1",
            params![lease.stack],
            |row| row.get(0),
        )?;
        Ok(to_version(version))
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, stack: &str) -> Result<StackState, StateError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = StackState::empty(stack);

        let head: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT version, lease FROM stacks WHERE stack = ?1",
                params![stack],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((version, lease)) = head {
            state.version = to_version(version);
            state.lease = lease;
        }

        let mut stmt =
            conn.prepare("SELECT body FROM records WHERE stack = ?1 ORDER BY logical_id")?;
        let bodies = stmt
            .query_map(params![stack], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for body in bodies {
            let record: DeployedRecord = serde_json::from_str(&body)?;
            state.records.insert(record.logical_id.clone(), record);
        }
        Ok(state)
    }

    fn begin_apply(&self, stack: &str, expected_version: u64) -> Result<ApplyLease, StateError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO stacks (stack, version) VALUES (?1, 0)",
            params![stack],
        )?;
        let (version, holder): (i64, Option<String>) = tx.query_row(
            "SELECT version, lease FROM stacks WHERE stack = ?1",
            params![stack],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if let Some(holder) = holder {
            return Err(concurrent(stack, format!("lease held by {}", holder)));
        }
        if to_version(version) != expected_version {
            return Err(concurrent(
                stack,
                format!("expected version {}, found {}", expected_version, version),
            ));
        }

        let token = new_lease_token();
        let changed = tx.execute(
            "UPDATE stacks SET lease = ?1 WHERE stack = ?2 AND version = ?3 AND lease IS NULL",
            params![token, stack, version],
        )?;
        if changed == 0 {
            return Err(concurrent(stack, "lost the race for the lease"));
        }
        tx.commit()?;
        Ok(ApplyLease {
            stack: stack.to_string(),
            token,
            version: to_version(version),
        })
    }

    fn put_record(&self, lease: &mut ApplyLease, record: &DeployedRecord) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let version = Self::bump(&tx, lease)?;
        tx.execute(
            "INSERT OR REPLACE INTO records
                (stack, logical_id, provider_id, property_hash, outputs, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lease.stack,
                record.logical_id,
                record.provider_id,
                record.property_hash,
                serde_json::to_string(&record.outputs)?,
                serde_json::to_string(record)?,
            ],
        )?;
        tx.commit()?;
        lease.version = version;
        Ok(())
    }

    fn remove_record(&self, lease: &mut ApplyLease, logical_id: &str) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let version = Self::bump(&tx, lease)?;
        tx.execute(
            "DELETE FROM records WHERE stack = ?1 AND logical_id = ?2",
            params![lease.stack, logical_id],
        )?;
        tx.commit()?;
        lease.version = version;
        Ok(())
    }

    fn finish_apply(&self, lease: ApplyLease) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = conn.execute(
            "UPDATE stacks SET lease = NULL WHERE stack = ?1 AND lease = ?2",
            params![lease.stack, lease.token],
        )?;
        if changed == 0 {
            return Err(concurrent(
                &lease.stack,
                format!("lease {} is no longer the holder", lease.token),
            ));
        }
        Ok(())
    }

    fn force_unlock(&self, stack: &str) -> Result<(), StateError> {
        tracing::warn!(stack, "force-unlocking state");
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "UPDATE stacks SET lease = NULL WHERE stack = ?1",
            params![stack],
        )?;
        Ok(())
    }
}
