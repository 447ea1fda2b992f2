use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Schema steps, applied in order. Entry `n` upgrades a database from
/// `user_version = n` to `n + 1`. Steps are only ever appended: columns are
/// never dropped and new columns carry defaults so older files open cleanly.
const MIGRATIONS: &[&str] = &[
    // 1: tasks and their execution history
    "
    CREATE TABLE IF NOT EXISTS tasks (
        id           TEXT    NOT NULL PRIMARY KEY,
        kind         TEXT    NOT NULL,
        schedule     TEXT    NOT NULL DEFAULT '',
        parameters   TEXT    NOT NULL DEFAULT '{}' CHECK (json_valid(parameters)),
        description  TEXT    NOT NULL DEFAULT '',
        priority     INTEGER NOT NULL DEFAULT 0,
        enabled      INTEGER NOT NULL DEFAULT 1,
        created_at   TEXT    NOT NULL,   -- RFC 3339, millisecond precision, UTC
        updated_at   TEXT    NOT NULL,
        next_fire    TEXT,               -- NULL: fires only when armed or triggered
        last_fire    TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_enabled   ON tasks (enabled);
    CREATE INDEX IF NOT EXISTS idx_tasks_next_fire ON tasks (next_fire);

    CREATE TABLE IF NOT EXISTS task_executions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id      TEXT    NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
        start_time   TEXT    NOT NULL,
        end_time     TEXT,
        duration_ms  INTEGER NOT NULL DEFAULT 0 CHECK (duration_ms >= 0),
        status       TEXT    NOT NULL,
        output       TEXT    NOT NULL DEFAULT '',
        error        TEXT    NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_executions_task_id    ON task_executions (task_id);
    CREATE INDEX IF NOT EXISTS idx_executions_start_time ON task_executions (start_time);
    ",
    // 2: retry bookkeeping
    "ALTER TABLE task_executions ADD COLUMN attempts INTEGER NOT NULL DEFAULT 1;",
];

/// Schema version a fully migrated database reports.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Per-connection settings. Foreign keys must be enabled on every connection
/// for the run-history cascade to fire.
pub fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    Ok(())
}

/// Bring the scheduler schema in `conn` up to [`SCHEMA_VERSION`].
///
/// Idempotent: a database that is already current is left untouched.
pub fn init_db(conn: &mut Connection) -> Result<()> {
    migrate_to(conn, SCHEMA_VERSION)
}

/// Apply migrations until the database reports `target`. Used directly by
/// tests that need an older schema on disk.
pub fn migrate_to(conn: &mut Connection, target: u32) -> Result<()> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current >= target {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (idx, step) in MIGRATIONS
        .iter()
        .enumerate()
        .take(target as usize)
        .skip(current as usize)
    {
        tx.execute_batch(step)?;
        info!(version = idx + 1, "scheduler schema migrated");
    }
    // PRAGMA does not accept bound parameters.
    tx.execute_batch(&format!("PRAGMA user_version = {target}"))?;
    tx.commit()?;
    Ok(())
}

/// Fixed-width UTC text form used for every stored instant.
///
/// `2024-02-29T00:00:00.000Z`. Lexicographic order equals time order; the
/// due-task and history queries rely on it.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

/// Parse a stored instant. Column index is only used for the error report.
pub fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub fn parse_ts_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}
