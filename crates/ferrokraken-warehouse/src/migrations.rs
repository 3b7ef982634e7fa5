use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_resource_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS executions (
    natural_key TEXT PRIMARY KEY,
    cursor_timestamp_ms BIGINT,
    cursor_timestamp TIMESTAMP,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS account_log (
    natural_key TEXT PRIMARY KEY,
    cursor_timestamp_ms BIGINT,
    cursor_timestamp TIMESTAMP,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS position_history (
    natural_key TEXT PRIMARY KEY,
    cursor_timestamp_ms BIGINT,
    cursor_timestamp TIMESTAMP,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS tickers (
    ordinal BIGINT NOT NULL,
    cursor_timestamp_ms BIGINT,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS open_positions (
    ordinal BIGINT NOT NULL,
    cursor_timestamp_ms BIGINT,
    raw_data TEXT NOT NULL,
    run_id TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0002_sync_bookkeeping",
        sql: r#"
CREATE TABLE IF NOT EXISTS sync_state (
    resource TEXT PRIMARY KEY,
    last_timestamp_ms BIGINT,
    continuation_token TEXT,
    fallback_page_count BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS sync_log (
    run_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    operation TEXT NOT NULL,
    row_count BIGINT NOT NULL,
    timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0003_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_executions_cursor_ts ON executions(cursor_timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_account_log_cursor_ts ON account_log(cursor_timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_position_history_cursor_ts ON position_history(cursor_timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_sync_log_run_resource ON sync_log(run_id, resource);
"#,
    },
];

/// Applies every migration not yet recorded in `schema_migrations`.
pub fn apply_migrations(connection: &Connection) -> Result<usize, ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    let mut applied = 0;
    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
            applied += 1;
        }
    }

    Ok(applied)
}
