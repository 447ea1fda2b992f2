//! In-process control surface: task CRUD, manual runs and history.
//!
//! Every mutating call validates against the executor registry and the
//! schedule parser before touching the store. Nothing here waits on the
//! dispatcher except [`SchedulerHandle::run_now`].

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::info;

use crate::dispatcher::{Dispatcher, DispatcherStatus};
use crate::error::Result;
use crate::executor::{ExecutionResult, ExecutorRegistry};
use crate::schedule;
use crate::store::Store;
use crate::types::{now_ms, RunRecord, Task};

#[derive(Clone)]
pub struct SchedulerHandle {
    dispatcher: Arc<Dispatcher>,
}

impl SchedulerHandle {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn store(&self) -> &Store {
        self.dispatcher.store()
    }

    fn registry(&self) -> &ExecutorRegistry {
        self.dispatcher.registry()
    }

    fn validate(&self, task: &Task) -> Result<()> {
        self.registry().validate(&task.kind, &task.parameters)?;
        schedule::validate(&task.schedule)
    }

    /// Validate and persist a new task, returning its id.
    ///
    /// Scheduled tasks get their first fire computed from now; one-shot tasks
    /// keep whatever `next_fire` the caller set (usually none).
    pub fn create_task(&self, mut task: Task) -> Result<String> {
        self.validate(&task)?;
        let now = now_ms();
        if !task.schedule.trim().is_empty() {
            task.next_fire = schedule::next_after(&task.schedule, now)?;
        }
        task.created_at = now;
        task.updated_at = now;
        task.last_fire = None;
        self.store().create_task(&task)?;
        info!(task_id = %task.id, kind = %task.kind, next_fire = ?task.next_fire, "task created");
        Ok(task.id)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.store().get_task(id)
    }

    pub fn list_tasks(&self, include_disabled: bool) -> Result<Vec<Task>> {
        self.store().list_tasks(include_disabled)
    }

    /// Replace a task's definition. Fire bookkeeping is preserved unless the
    /// schedule text changed, in which case the next fire is recomputed.
    pub fn update_task(&self, mut task: Task) -> Result<Task> {
        self.validate(&task)?;
        let existing = self.store().get_task(&task.id)?;

        task.created_at = existing.created_at;
        task.last_fire = existing.last_fire;
        task.next_fire = if task.schedule.trim() != existing.schedule.trim() {
            schedule::next_after(&task.schedule, now_ms())?
        } else {
            existing.next_fire
        };

        let updated = self.store().update_task(&task)?;
        info!(task_id = %updated.id, "task updated");
        Ok(updated)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.store().delete_task(id)?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Enable or disable a task. Re-enabling a scheduled task recomputes its
    /// next fire from now so fires missed while disabled are not replayed.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        if enabled {
            let task = self.store().get_task(id)?;
            if !task.schedule.trim().is_empty() {
                let next = schedule::next_after(&task.schedule, now_ms())?;
                self.store().set_next_fire(id, next)?;
            }
        }
        self.store().set_enabled(id, enabled)?;
        info!(task_id = %id, enabled, "task toggled");
        Ok(())
    }

    /// Arm a task to fire at `at` (which may be in the past).
    pub fn schedule_once(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.store().set_next_fire(id, Some(at.trunc_subsecs(3)))?;
        info!(task_id = %id, at = %at, "task armed");
        Ok(())
    }

    /// Run a task immediately and return the executor's result. The run is
    /// recorded like a scheduled one.
    pub async fn run_now(&self, id: &str) -> Result<ExecutionResult> {
        self.dispatcher.run_now(id).await
    }

    /// Most recent runs first; `limit == 0` returns all.
    pub fn runs_for_task(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.store().runs_for_task(id, limit)
    }

    pub fn get_run(&self, id: i64) -> Result<RunRecord> {
        self.store().get_run(id)
    }

    pub fn prune_history(&self) -> Result<usize> {
        self.dispatcher.prune_history()
    }

    pub fn status(&self) -> DispatcherStatus {
        self.dispatcher.status()
    }
}
