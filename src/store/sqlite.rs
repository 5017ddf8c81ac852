//! SQLite-backed run history.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{AttemptHandle, HistoryStore};
use crate::errors::StoreError;
use crate::status::{RunRef, Status};

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dag_name TEXT NOT NULL,
        request_id TEXT NOT NULL,
        root_name TEXT,
        root_request_id TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        open INTEGER NOT NULL DEFAULT 1,
        snapshot TEXT NOT NULL,
        UNIQUE (dag_name, request_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_attempts_dag_started
        ON attempts (dag_name, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_attempts_root
        ON attempts (root_name, root_request_id)",
    "CREATE TABLE IF NOT EXISTS attempt_journal (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dag_name TEXT NOT NULL,
        request_id TEXT NOT NULL,
        written_at TEXT NOT NULL,
        snapshot TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS suspend_flags (
        dag_name TEXT PRIMARY KEY,
        suspended INTEGER NOT NULL
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the history database at `path`.
    pub async fn open(path: &Path) -> Result<SqliteStore, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        for ddl in TABLES {
            sqlx::query(ddl).execute(&pool).await?;
        }
        debug!(path = %path.display(), "opened history store");
        Ok(SqliteStore { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_snapshot(
        &self,
        dag_name: &str,
        request_id: &str,
    ) -> Result<Status, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM attempts WHERE dag_name = ?1 AND request_id = ?2")
            .bind(dag_name)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| StoreError::NoStatusData(dag_name.to_string()))?;
        let raw: String = row.get("snapshot");
        Ok(Status::from_json(&raw)?)
    }
}

pub struct SqliteAttempt {
    pool: SqlitePool,
    dag_name: String,
    request_id: String,
}

#[async_trait]
impl AttemptHandle for SqliteAttempt {
    fn dag_name(&self) -> &str {
        &self.dag_name
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    async fn write(&self, status: &Status) -> Result<(), StoreError> {
        let snapshot = status.to_json()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE attempts SET snapshot = ?1 WHERE dag_name = ?2 AND request_id = ?3")
            .bind(&snapshot)
            .bind(&self.dag_name)
            .bind(&self.request_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO attempt_journal (dag_name, request_id, written_at, snapshot)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&self.dag_name)
        .bind(&self.request_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&snapshot)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_status(&self) -> Result<Status, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM attempts WHERE dag_name = ?1 AND request_id = ?2")
            .bind(&self.dag_name)
            .bind(&self.request_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| StoreError::NoStatusData(self.dag_name.clone()))?;
        let raw: String = row.get("snapshot");
        Ok(Status::from_json(&raw)?)
    }

    async fn close(&self, finished_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE attempts SET open = 0, finished_at = ?1
             WHERE dag_name = ?2 AND request_id = ?3",
        )
        .bind(finished_at.to_rfc3339())
        .bind(&self.dag_name)
        .bind(&self.request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn open_attempt(
        &self,
        dag_name: &str,
        request_id: &str,
        root: Option<&RunRef>,
        started_at: DateTime<Utc>,
    ) -> Result<Box<dyn AttemptHandle>, StoreError> {
        let mut initial = Status::default();
        initial.request_id = request_id.to_string();
        initial.name = dag_name.to_string();
        initial.root_ref = root.cloned();
        initial.started_at = Some(started_at);
        initial.set_status(crate::status::RunStatus::Running);

        // Retry re-opens the same (dag, request id) attempt; the journal
        // keeps the full history either way.
        sqlx::query(
            "INSERT INTO attempts
                (dag_name, request_id, root_name, root_request_id, started_at, finished_at, open, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 1, ?6)
             ON CONFLICT (dag_name, request_id)
             DO UPDATE SET started_at = excluded.started_at, finished_at = NULL, open = 1",
        )
        .bind(dag_name)
        .bind(request_id)
        .bind(root.map(|r| r.name.as_str()))
        .bind(root.map(|r| r.request_id.as_str()))
        .bind(started_at.to_rfc3339())
        .bind(initial.to_json()?)
        .execute(&self.pool)
        .await?;

        Ok(Box::new(SqliteAttempt {
            pool: self.pool.clone(),
            dag_name: dag_name.to_string(),
            request_id: request_id.to_string(),
        }))
    }

    async fn find_by_request_id(
        &self,
        dag_name: &str,
        request_id: &str,
    ) -> Result<Status, StoreError> {
        self.fetch_snapshot(dag_name, request_id).await
    }

    async fn find_sub_attempt(
        &self,
        root: &RunRef,
        sub_request_id: &str,
    ) -> Result<Status, StoreError> {
        let row = sqlx::query(
            "SELECT snapshot FROM attempts
             WHERE root_name = ?1 AND root_request_id = ?2 AND request_id = ?3",
        )
        .bind(&root.name)
        .bind(&root.request_id)
        .bind(sub_request_id)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or_else(|| StoreError::NoStatusData(root.name.clone()))?;
        let raw: String = row.get("snapshot");
        Ok(Status::from_json(&raw)?)
    }

    async fn latest(&self, dag_name: &str) -> Result<Status, StoreError> {
        let mut recent = self.recent(dag_name, 1).await?;
        recent
            .pop()
            .ok_or_else(|| StoreError::NoStatusData(dag_name.to_string()))
    }

    async fn recent(&self, dag_name: &str, n: usize) -> Result<Vec<Status>, StoreError> {
        let rows = sqlx::query(
            "SELECT snapshot FROM attempts
             WHERE dag_name = ?1 AND root_request_id IS NULL
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )
        .bind(dag_name)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("snapshot");
            out.push(Status::from_json(&raw)?);
        }
        if out.is_empty() {
            return Err(StoreError::NoStatusData(dag_name.to_string()));
        }
        Ok(out)
    }

    async fn update(
        &self,
        dag_name: &str,
        request_id: &str,
        status: &Status,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE attempts SET snapshot = ?1 WHERE dag_name = ?2 AND request_id = ?3",
        )
        .bind(status.to_json()?)
        .bind(dag_name)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NoStatusData(dag_name.to_string()));
        }
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE attempts SET dag_name = ?1 WHERE dag_name = ?2")
            .bind(new_name)
            .bind(old_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE attempts SET root_name = ?1 WHERE root_name = ?2")
            .bind(new_name)
            .bind(old_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE suspend_flags SET dag_name = ?1 WHERE dag_name = ?2",
        )
        .bind(new_name)
        .bind(old_name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
