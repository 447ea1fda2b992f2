//! Durable task and run-history storage on SQLite.
//!
//! All access goes through one connection behind a mutex; multi-row
//! mutations run inside `IMMEDIATE` transactions so they serialize against
//! every other writer on the same file.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    db::{self, parse_ts, parse_ts_opt, ts, ts_opt},
    error::{Result, SchedulerError},
    types::{now_ms, Parameters, RunRecord, RunStatus, Task},
};

const TASK_COLUMNS: &str = "id, kind, schedule, parameters, description, priority, enabled,
     created_at, updated_at, next_fire, last_fire";

const RUN_COLUMNS: &str =
    "id, task_id, start_time, end_time, duration_ms, status, output, error, attempts";

/// Cloneable handle to the scheduler database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!(path = %path.display(), "opening scheduler database");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an already opened connection, configuring and migrating it.
    pub fn from_connection(mut conn: Connection) -> Result<Self> {
        db::configure(&conn)?;
        db::init_db(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written:
        // every mutation is a statement or a transaction.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- tasks ---------------------------------------------------------------

    /// Insert a new task. Fails with `Duplicate` when the id is taken.
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let params_json = serde_json::to_string(&task.parameters)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks
             (id, kind, schedule, parameters, description, priority, enabled,
              created_at, updated_at, next_fire, last_fire)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.id,
                task.kind,
                task.schedule,
                params_json,
                task.description,
                task.priority,
                task.enabled,
                ts(&task.created_at),
                ts(&task.updated_at),
                ts_opt(&task.next_fire),
                ts_opt(&task.last_fire),
            ],
        )
        .map_err(|e| match constraint_code(&e) {
            Some(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) => SchedulerError::Duplicate {
                id: task.id.clone(),
            },
            _ => SchedulerError::Storage(e),
        })?;
        debug!(task_id = %task.id, kind = %task.kind, "task inserted");
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.lock();
        get_task_locked(&conn, id)
    }

    /// Tasks ordered by priority (highest first), newest first within a priority.
    pub fn list_tasks(&self, include_disabled: bool) -> Result<Vec<Task>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE ?1 OR enabled = 1
             ORDER BY priority DESC, created_at DESC, id"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let tasks = stmt
            .query_map([include_disabled], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Replace every mutable field of `task` and bump its update stamp.
    ///
    /// `last_fire` and `created_at` are owned by the store and the dispatcher
    /// and are left untouched. Returns the task as now stored.
    pub fn update_task(&self, task: &Task) -> Result<Task> {
        let params_json = serde_json::to_string(&task.parameters)?;
        let now = now_ms();
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE tasks SET kind = ?1, schedule = ?2, parameters = ?3, description = ?4,
                    priority = ?5, enabled = ?6, next_fire = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                task.kind,
                task.schedule,
                params_json,
                task.description,
                task.priority,
                task.enabled,
                ts_opt(&task.next_fire),
                ts(&now),
                task.id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound {
                id: task.id.clone(),
            });
        }
        get_task_locked(&conn, &task.id)
    }

    /// Delete a task together with its whole run history, atomically.
    pub fn delete_task(&self, id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let runs = tx.execute("DELETE FROM task_executions WHERE task_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n == 0 {
            // dropping `tx` rolls back
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(task_id = %id, runs, "task deleted");
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE tasks SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, ts(&now_ms()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Set or clear the next planned fire. Counts as an update of the task.
    pub fn set_next_fire(&self, id: &str, next_fire: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE tasks SET next_fire = ?1, updated_at = ?2 WHERE id = ?3",
            params![ts_opt(&next_fire), ts(&now_ms()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn set_last_fire(&self, id: &str, last_fire: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE tasks SET last_fire = ?1 WHERE id = ?2",
            params![ts(&last_fire), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Enabled tasks whose next fire has arrived.
    ///
    /// Ordered by priority (highest first), then earliest next fire. Tasks
    /// without a next fire are never due; they run only when armed with
    /// [`Store::set_next_fire`] or triggered manually.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE enabled = 1 AND next_fire IS NOT NULL AND next_fire <= ?1
             ORDER BY priority DESC, next_fire ASC, created_at ASC"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let tasks = stmt
            .query_map([ts(&now)], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Advance a due task before it runs: record `last_fire = now` and the
    /// new `next_fire`, but only if the row is unchanged since `seen` was read.
    ///
    /// Returns `false` when another writer got there first (the task was
    /// edited, disabled, armed or deleted); the caller re-reads next tick.
    pub fn claim_fire(
        &self,
        seen: &Task,
        now: DateTime<Utc>,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "UPDATE tasks SET last_fire = ?1, next_fire = ?2
             WHERE id = ?3 AND enabled = 1 AND updated_at = ?4 AND next_fire IS ?5",
            params![
                ts(&now),
                ts_opt(&next_fire),
                seen.id,
                ts(&seen.updated_at),
                ts_opt(&seen.next_fire),
            ],
        )?;
        tx.commit()?;
        Ok(n == 1)
    }

    // --- runs ----------------------------------------------------------------

    /// Insert a run record and return its assigned id.
    pub fn create_run(&self, run: &RunRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_executions
             (task_id, start_time, end_time, duration_ms, status, output, error, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.task_id,
                ts(&run.started_at),
                ts_opt(&run.ended_at),
                run.duration_ms,
                run.status.to_string(),
                run.output,
                run.error,
                run.attempts,
            ],
        )
        .map_err(|e| match constraint_code(&e) {
            Some(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => SchedulerError::NotFound {
                id: run.task_id.clone(),
            },
            _ => SchedulerError::Storage(e),
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrite the mutable fields (end, duration, status, output, error,
    /// attempts) of an existing run.
    pub fn update_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE task_executions
             SET end_time = ?1, duration_ms = ?2, status = ?3, output = ?4, error = ?5,
                 attempts = ?6
             WHERE id = ?7",
            params![
                ts_opt(&run.ended_at),
                run.duration_ms,
                run.status.to_string(),
                run.output,
                run.error,
                run.attempts,
                run.id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::RunNotFound { id: run.id });
        }
        Ok(())
    }

    pub fn get_run(&self, id: i64) -> Result<RunRecord> {
        let conn = self.lock();
        let sql = format!("SELECT {RUN_COLUMNS} FROM task_executions WHERE id = ?1");
        conn.query_row(&sql, [id], row_to_run)
            .optional()?
            .ok_or(SchedulerError::RunNotFound { id })
    }

    /// Most recent runs first. `limit == 0` returns the full history.
    pub fn runs_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_executions
             WHERE task_id = ?1
             ORDER BY start_time DESC, id DESC
             LIMIT ?2"
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = conn.prepare_cached(&sql)?;
        let runs = stmt
            .query_map(params![task_id, limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Runs currently marked `running`, oldest first.
    pub fn running_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_executions
             WHERE status = 'running'
             ORDER BY start_time ASC, id ASC"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let runs = stmt
            .query_map([], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Apply the retention policy. Returns the number of deleted runs.
    ///
    /// - `max_age > 0`: finished runs that started before `now - max_age` go.
    /// - `max_per_task > 0`: only the newest `max_per_task` finished runs of
    ///   each task survive.
    ///
    /// In-flight runs are never pruned.
    pub fn prune_runs(&self, max_age: Duration, max_per_task: usize) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = 0;

        if !max_age.is_zero() {
            let age = chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 1_000));
            let cutoff = now_ms()
                .checked_sub_signed(age)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            deleted += tx.execute(
                "DELETE FROM task_executions WHERE end_time IS NOT NULL AND start_time < ?1",
                [ts(&cutoff)],
            )?;
        }

        if max_per_task > 0 {
            deleted += tx.execute(
                "DELETE FROM task_executions WHERE end_time IS NOT NULL AND id IN (
                     SELECT id FROM (
                         SELECT id, ROW_NUMBER() OVER (
                             PARTITION BY task_id ORDER BY start_time DESC, id DESC
                         ) AS rn
                         FROM task_executions
                     ) WHERE rn > ?1
                 )",
                [max_per_task as i64],
            )?;
        }

        tx.commit()?;
        if deleted > 0 {
            info!(deleted, "pruned run history");
        }
        Ok(deleted)
    }

    /// Close runs left `running` by a previous process as `failed`.
    ///
    /// Called when a dispatcher starts: no worker can own those rows any more.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.running_runs()?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for mut run in stale.iter().cloned() {
            let output = std::mem::take(&mut run.output);
            run.finish(
                RunStatus::Failed,
                now,
                output,
                "interrupted by scheduler restart",
            );
            tx.execute(
                "UPDATE task_executions
                 SET end_time = ?1, duration_ms = ?2, status = ?3, error = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![
                    ts_opt(&run.ended_at),
                    run.duration_ms,
                    run.status.to_string(),
                    run.error,
                    run.id,
                ],
            )?;
        }
        tx.commit()?;
        if !stale.is_empty() {
            warn!(count = stale.len(), "closed runs interrupted by a restart");
        }
        Ok(stale.len())
    }
}

fn get_task_locked(conn: &Connection, id: &str) -> Result<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, [id], row_to_task)
        .optional()?
        .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })
}

fn constraint_code(e: &rusqlite::Error) -> Option<i32> {
    match e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            Some(err.extended_code)
        }
        _ => None,
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let params_json: String = row.get(3)?;
    let parameters: Parameters = serde_json::from_str(&params_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Task {
        id: row.get(0)?,
        kind: row.get(1)?,
        schedule: row.get(2)?,
        parameters,
        description: row.get(4)?,
        priority: row.get(5)?,
        enabled: row.get(6)?,
        created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        next_fire: parse_ts_opt(9, row.get(9)?)?,
        last_fire: parse_ts_opt(10, row.get(10)?)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(5)?;
    let status: RunStatus = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(RunRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: parse_ts(2, &row.get::<_, String>(2)?)?,
        ended_at: parse_ts_opt(3, row.get(3)?)?,
        duration_ms: row.get(4)?,
        status,
        output: row.get(6)?,
        error: row.get(7)?,
        attempts: row.get(8)?,
    })
}
