//! DuckDB destination for ferrokraken: one table per resource, persisted cursors, and a
//! per-run audit log.

pub mod duckdb;
pub mod migrations;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection, Row};
use ferrokraken_core::{
    CursorState, CursorStore, RawRecord, RecordSink, ResourceDescriptor, StoreError, Timestamp,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub use duckdb::{DuckDbConnectionManager, PooledConnection};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("query rejected: {0}")]
    QueryRejected(String),
}

impl From<WarehouseError> for StoreError {
    fn from(error: WarehouseError) -> Self {
        StoreError::new(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl WarehouseConfig {
    /// Config for an explicit database file, keeping the resolved home directory.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let home = resolve_ferrokraken_home();
        let db_path = home.join("warehouse.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// One `sync_log` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub run_id: String,
    pub resource: String,
    pub operation: String,
    pub row_count: i64,
}

#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Opens a database without creating it or applying migrations; `None` when the file
    /// is missing.
    pub fn open_existing(config: WarehouseConfig) -> Result<Option<Self>, WarehouseError> {
        if !config.db_path.exists() {
            return Ok(None);
        }
        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        Ok(Some(Self { config, manager }))
    }

    pub fn has_table(&self, table: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let applied = migrations::apply_migrations(&connection)?;
        if applied > 0 {
            info!(db_path = %self.db_path().display(), applied, "applied warehouse migrations");
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    pub fn home(&self) -> &Path {
        self.config.home.as_path()
    }

    /// Upserts keyed records by natural key and logs the batch under `run_id`.
    /// Within one batch the last record for a key wins.
    pub fn append_records(
        &self,
        resource: &str,
        run_id: &str,
        records: &[RawRecord],
    ) -> Result<usize, WarehouseError> {
        let table = incremental_table(resource)?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut latest = BTreeMap::new();
        for record in records {
            latest.insert(record.natural_key.storage_key(), record);
        }

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let sql = format!(
                r#"
INSERT OR REPLACE INTO {table} (
    natural_key, cursor_timestamp_ms, cursor_timestamp, raw_data, run_id, loaded_at
) VALUES (
    ?, ?, epoch_ms(CAST(? AS BIGINT)), ?, ?, CURRENT_TIMESTAMP
)
"#
            );
            let mut statement = connection.prepare(sql.as_str())?;
            for (key, record) in &latest {
                let millis = record.timestamp.map(Timestamp::as_millis);
                statement.execute(params![
                    key,
                    millis,
                    millis,
                    record.canonical_payload,
                    run_id
                ])?;
            }
            log_operation(&connection, run_id, resource, "append", latest.len())?;
            Ok(latest.len())
        })();

        let written = finalize_transaction(&connection, result)?;
        debug!(resource, records = written, "appended records");
        Ok(written)
    }

    /// Replaces the whole snapshot table for `resource` in one transaction.
    pub fn replace_records(
        &self,
        resource: &str,
        run_id: &str,
        records: &[RawRecord],
    ) -> Result<usize, WarehouseError> {
        let table = snapshot_table(resource)?;

        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            connection.execute_batch(format!("DELETE FROM {table}").as_str())?;
            let sql = format!(
                "INSERT INTO {table} (ordinal, cursor_timestamp_ms, raw_data, run_id, loaded_at) \
                 VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)"
            );
            let mut statement = connection.prepare(sql.as_str())?;
            for (ordinal, record) in records.iter().enumerate() {
                statement.execute(params![
                    ordinal as i64,
                    record.timestamp.map(Timestamp::as_millis),
                    record.canonical_payload,
                    run_id
                ])?;
            }
            log_operation(&connection, run_id, resource, "replace", records.len())?;
            Ok(records.len())
        })();

        let written = finalize_transaction(&connection, result)?;
        debug!(resource, records = written, "replaced snapshot");
        Ok(written)
    }

    /// Rows currently stored for a resource.
    pub fn row_count(&self, resource: &str) -> Result<i64, WarehouseError> {
        let table = resource_table(resource)?;
        let connection = self.manager.acquire()?;
        let count = connection.query_row(
            format!("SELECT COUNT(*) FROM {table}").as_str(),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Canonical payload stored under a natural key, if any.
    pub fn payload(&self, resource: &str, storage_key: &str) -> Result<Option<String>, WarehouseError> {
        let table = incremental_table(resource)?;
        let connection = self.manager.acquire()?;
        let mut statement = connection
            .prepare(format!("SELECT raw_data FROM {table} WHERE natural_key = ?").as_str())?;
        let mut rows = statement.query_map(params![storage_key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn sync_log(&self, run_id: &str) -> Result<Vec<SyncLogEntry>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT run_id, resource, operation, row_count FROM sync_log \
             WHERE run_id = ? ORDER BY timestamp, resource",
        )?;
        let entries = statement
            .query_map(params![run_id], |row| {
                Ok(SyncLogEntry {
                    run_id: row.get(0)?,
                    resource: row.get(1)?,
                    operation: row.get(2)?,
                    row_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn load_cursor(&self, resource: &str) -> Result<Option<CursorState>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT last_timestamp_ms, continuation_token, fallback_page_count \
             FROM sync_state WHERE resource = ?",
        )?;
        let mut rows = statement.query_map(params![resource], |row| read_cursor(row, 0))?;
        Ok(rows.next().transpose()?)
    }

    /// Replaces the stored cursor in a single statement.
    pub fn commit_cursor(&self, resource: &str, state: &CursorState) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        connection.execute(
            r#"
INSERT OR REPLACE INTO sync_state (
    resource, last_timestamp_ms, continuation_token, fallback_page_count, updated_at
) VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
"#,
            params![
                resource,
                state.last_timestamp.map(Timestamp::as_millis),
                state.continuation_token,
                i64::from(state.fallback_page_count)
            ],
        )?;
        debug!(resource, "committed cursor");
        Ok(())
    }

    pub fn reset_cursor(&self, resource: &str) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        let removed = connection.execute(
            "DELETE FROM sync_state WHERE resource = ?",
            params![resource],
        )?;
        if removed > 0 {
            info!(resource, "cursor reset");
        }
        Ok(removed > 0)
    }

    pub fn list_cursors(&self) -> Result<BTreeMap<String, CursorState>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT resource, last_timestamp_ms, continuation_token, fallback_page_count \
             FROM sync_state ORDER BY resource",
        )?;
        let cursors = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, read_cursor(row, 1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(cursors)
    }
}

impl std::fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warehouse")
            .field("db_path", &self.config.db_path)
            .finish_non_exhaustive()
    }
}

impl CursorStore for Warehouse {
    fn load(&self, resource: &str) -> Result<Option<CursorState>, StoreError> {
        Ok(self.load_cursor(resource)?)
    }

    fn commit(&self, resource: &str, state: &CursorState) -> Result<(), StoreError> {
        Ok(self.commit_cursor(resource, state)?)
    }

    fn reset(&self, resource: &str) -> Result<bool, StoreError> {
        Ok(self.reset_cursor(resource)?)
    }

    fn list(&self) -> Result<BTreeMap<String, CursorState>, StoreError> {
        Ok(self.list_cursors()?)
    }
}

/// `RecordSink` writing into a warehouse, tagging every row with the run id.
#[derive(Debug, Clone)]
pub struct WarehouseSink {
    warehouse: Warehouse,
    run_id: String,
}

impl WarehouseSink {
    pub fn new(warehouse: Warehouse, run_id: impl Into<String>) -> Self {
        Self {
            warehouse,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl RecordSink for WarehouseSink {
    fn append(&self, descriptor: &ResourceDescriptor, records: &[RawRecord]) -> Result<usize, StoreError> {
        Ok(self
            .warehouse
            .append_records(descriptor.name, &self.run_id, records)?)
    }

    fn replace(
        &self,
        descriptor: &ResourceDescriptor,
        records: &[RawRecord],
    ) -> Result<usize, StoreError> {
        Ok(self
            .warehouse
            .replace_records(descriptor.name, &self.run_id, records)?)
    }
}

fn read_cursor(row: &Row<'_>, offset: usize) -> Result<CursorState, ::duckdb::Error> {
    let last_timestamp: Option<i64> = row.get(offset)?;
    let continuation_token: Option<String> = row.get(offset + 1)?;
    let fallback_page_count: i64 = row.get(offset + 2)?;
    Ok(CursorState {
        last_timestamp: last_timestamp.map(Timestamp::from_millis),
        continuation_token,
        fallback_page_count: u32::try_from(fallback_page_count).unwrap_or(0),
    })
}

fn log_operation(
    connection: &Connection,
    run_id: &str,
    resource: &str,
    operation: &str,
    row_count: usize,
) -> Result<(), WarehouseError> {
    connection.execute(
        "INSERT INTO sync_log (run_id, resource, operation, row_count, timestamp) \
         VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)",
        params![run_id, resource, operation, row_count as i64],
    )?;
    Ok(())
}

fn incremental_table(resource: &str) -> Result<&'static str, WarehouseError> {
    match resource {
        "executions" => Ok("executions"),
        "account_log" => Ok("account_log"),
        "position_history" => Ok("position_history"),
        other => Err(WarehouseError::QueryRejected(format!(
            "no keyed table for resource '{other}'"
        ))),
    }
}

fn snapshot_table(resource: &str) -> Result<&'static str, WarehouseError> {
    match resource {
        "tickers" => Ok("tickers"),
        "open_positions" => Ok("open_positions"),
        other => Err(WarehouseError::QueryRejected(format!(
            "no snapshot table for resource '{other}'"
        ))),
    }
}

fn resource_table(resource: &str) -> Result<&'static str, WarehouseError> {
    incremental_table(resource).or_else(|_| snapshot_table(resource))
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_ferrokraken_home() -> PathBuf {
    if let Some(path) = env::var_os("FERROKRAKEN_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ferrokraken");
    }

    PathBuf::from(".ferrokraken")
}
