//! Durable run history.
//!
//! The contract is a small async trait so the engine never couples to the
//! storage substrate; the shipped implementation is SQLite in WAL mode,
//! which gives concurrent readers and the one-writer-per-attempt guarantee
//! without hand-rolled file locks. Step stdout/stderr remain ordinary
//! files under the run's log directory — the store holds snapshots.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::status::{RunRef, Status};

/// An open, exclusively-held attempt record.
#[async_trait]
pub trait AttemptHandle: Send + Sync {
    fn dag_name(&self) -> &str;
    fn request_id(&self) -> &str;

    /// Overwrite the current snapshot and append it to the audit journal.
    async fn write(&self, status: &Status) -> Result<(), StoreError>;

    async fn read_status(&self) -> Result<Status, StoreError>;

    /// Mark the attempt finished; the handle must not be written after.
    async fn close(&self, finished_at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Append-only persistence of run attempts, keyed `(dag name, request id)`
/// with hierarchical lookup for sub-runs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn open_attempt(
        &self,
        dag_name: &str,
        request_id: &str,
        root: Option<&RunRef>,
        started_at: DateTime<Utc>,
    ) -> Result<Box<dyn AttemptHandle>, StoreError>;

    async fn find_by_request_id(
        &self,
        dag_name: &str,
        request_id: &str,
    ) -> Result<Status, StoreError>;

    /// Look up a sub-run through its root run reference.
    async fn find_sub_attempt(
        &self,
        root: &RunRef,
        sub_request_id: &str,
    ) -> Result<Status, StoreError>;

    /// Most recent top-level attempt for a DAG.
    async fn latest(&self, dag_name: &str) -> Result<Status, StoreError>;

    /// Last `n` top-level attempts, newest first.
    async fn recent(&self, dag_name: &str, n: usize) -> Result<Vec<Status>, StoreError>;

    /// Surgical snapshot patch (operator-initiated status override).
    async fn update(
        &self,
        dag_name: &str,
        request_id: &str,
        status: &Status,
    ) -> Result<(), StoreError>;

    /// Re-key every attempt of a renamed DAG.
    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError>;
}
