use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use super::error::Error;

pub type Entity = BTreeMap<String, Value>;

/// One row written by a `mysqlSync*` trigger into `table_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLogRow {
    pub table_name: String,
    pub primary_key: String,
}

/// The database driver seam. Real traffic goes through [`MysqlConnection`]
/// (`mysql_async`); tests substitute an in-memory fake so the apply
/// invariants are exercisable without a live MySQL server.
#[async_trait]
pub trait Connection: Send {
    /// `SELECT 'connected'` — the liveness probe issued on every tick.
    async fn ping(&mut self) -> Result<(), Error>;

    /// Idempotently create `table_changes`/`sync_status`, drop stale
    /// `mysqlSync*` triggers and install fresh ones for `sync_tables`.
    async fn setup(&mut self, sync_tables: &[String]) -> Result<(), Error>;

    /// Resolve and cache-on-first-use a table's primary key column.
    async fn primary_key_column(&mut self, table: &str) -> Result<String, Error>;

    /// Poll the oldest `table_changes` row (if any) and delete it.
    async fn poll_next_change(&mut self) -> Result<Option<ChangeLogRow>, Error>;

    /// Delete `table_changes` rows for `(table, id)`, suppressing the
    /// echo of a change the apply stage itself produced.
    async fn delete_change_log_rows(&mut self, table: &str, id: &str) -> Result<(), Error>;

    /// Fetch the current row by primary key, or `None` if absent (a
    /// delete).
    async fn fetch_row(&mut self, table: &str, pk_col: &str, id: &str)
        -> Result<Option<Entity>, Error>;

    async fn row_exists(&mut self, table: &str, pk_col: &str, id: &str) -> Result<bool, Error>;

    async fn insert_row(&mut self, table: &str, entity: &Entity) -> Result<(), Error>;

    async fn update_row(
        &mut self,
        table: &str,
        pk_col: &str,
        id: &str,
        entity: &Entity,
    ) -> Result<(), Error>;

    async fn delete_row(&mut self, table: &str, pk_col: &str, id: &str) -> Result<(), Error>;

    /// Current `date` stored for `status_id`, if a `sync_status` row
    /// exists.
    async fn status_date(&mut self, status_id: &str) -> Result<Option<i64>, Error>;

    async fn upsert_status(
        &mut self,
        status_id: &str,
        table: &str,
        id: &str,
        sender: &str,
        date: i64,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), Error>;
}
