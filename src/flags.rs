//! Per-DAG suspension flags.
//!
//! Suspension prevents the (external) cron trigger from auto-starting a
//! DAG; explicit starts ignore it. Flags live in the same database as run
//! history so one home directory stays self-contained.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::errors::StoreError;
use crate::store::SqliteStore;

#[derive(Clone)]
pub struct FlagStore {
    pool: SqlitePool,
}

impl FlagStore {
    pub fn new(store: &SqliteStore) -> FlagStore {
        FlagStore {
            pool: store.pool().clone(),
        }
    }

    pub async fn is_suspended(&self, dag_name: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT suspended FROM suspend_flags WHERE dag_name = ?1")
            .bind(dag_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<i64, _>("suspended") != 0)
            .unwrap_or(false))
    }

    pub async fn toggle_suspend(&self, dag_name: &str, suspend: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO suspend_flags (dag_name, suspended) VALUES (?1, ?2)
             ON CONFLICT (dag_name) DO UPDATE SET suspended = excluded.suspended",
        )
        .bind(dag_name)
        .bind(suspend as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
