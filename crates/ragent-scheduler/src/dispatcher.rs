//! Tick-driven dispatcher.
//!
//! Every tick the dispatcher asks the store for due tasks, advances each
//! one's next fire with a compare-and-set, and hands the work to a worker
//! task holding one semaphore slot. A task with a run still in flight is
//! left due until that run finishes, so no task overlaps with itself. `stop`
//! cancels in-flight runs and waits for the workers, bounded by the drain
//! timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ragent_core::SchedulerConfig;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::executor::{ExecutionResult, Executor, ExecutorRegistry};
use crate::schedule;
use crate::store::Store;
use crate::types::{now_ms, RunRecord, RunStatus, Task};

/// Lifecycle of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Stopped,
    Running,
    /// `stop` was called and in-flight runs are winding down.
    Draining,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatcherState::Stopped => "stopped",
            DispatcherState::Running => "running",
            DispatcherState::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub state: DispatcherState,
    /// Worker tasks (scheduled and on-demand) not yet finished.
    pub in_flight: usize,
    pub max_concurrent: usize,
}

/// Per-start resources. Replaced wholesale on every `start`.
struct Lifecycle {
    state: DispatcherState,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tick_loop: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn stopped() -> Self {
        Self {
            state: DispatcherState::Stopped,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tick_loop: None,
        }
    }
}

/// Handles into the current run of the dispatcher, cloned out of the lock.
#[derive(Clone)]
struct RunContext {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

type ActiveRuns = Arc<Mutex<HashMap<String, usize>>>;

/// Marks a task as having a run in flight until dropped.
struct ActiveGuard {
    active: ActiveRuns,
    task_id: String,
}

impl ActiveGuard {
    fn enter(active: &ActiveRuns, task_id: &str) -> Self {
        *lock_active(active).entry(task_id.to_string()).or_insert(0) += 1;
        Self {
            active: Arc::clone(active),
            task_id: task_id.to_string(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = lock_active(&self.active);
        if let Some(count) = active.get_mut(&self.task_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.task_id);
            }
        }
    }
}

fn lock_active(active: &ActiveRuns) -> MutexGuard<'_, HashMap<String, usize>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Dispatcher {
    store: Store,
    registry: Arc<ExecutorRegistry>,
    config: SchedulerConfig,
    lifecycle: Mutex<Lifecycle>,
    /// Shared by every start so workers abandoned by a timed-out drain keep
    /// counting against the cap.
    slots: Arc<Semaphore>,
    /// Task id → runs in flight, scheduled and on-demand.
    active: ActiveRuns,
    recovered: AtomicBool,
}

impl Dispatcher {
    pub fn new(store: Store, registry: Arc<ExecutorRegistry>, config: SchedulerConfig) -> Self {
        let capacity = config.max_concurrent_tasks.max(1);
        Self {
            store,
            registry,
            config,
            lifecycle: Mutex::new(Lifecycle::stopped()),
            slots: Arc::new(Semaphore::new(capacity)),
            active: Arc::new(Mutex::new(HashMap::new())),
            recovered: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn capacity(&self) -> usize {
        self.config.max_concurrent_tasks.max(1)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> DispatcherState {
        self.lock().state
    }

    pub fn status(&self) -> DispatcherStatus {
        let lc = self.lock();
        DispatcherStatus {
            state: lc.state,
            in_flight: if lc.state == DispatcherState::Stopped {
                0
            } else {
                lc.tracker.len()
            },
            max_concurrent: self.capacity(),
        }
    }

    /// Whether a run of `task_id` is currently in flight.
    pub fn is_active(&self, task_id: &str) -> bool {
        lock_active(&self.active).contains_key(task_id)
    }

    /// Start the tick loop. Must be called from within a tokio runtime.
    ///
    /// On the first start, run records left `running` by a previous process
    /// are closed as failed before the first tick. Later restarts leave them
    /// alone: they belong to workers of this process.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut lc = self.lock();
        if lc.state != DispatcherState::Stopped {
            return Err(SchedulerError::AlreadyRunning);
        }

        if !self.recovered.load(Ordering::SeqCst) {
            self.store.recover_interrupted(now_ms())?;
            self.recovered.store(true, Ordering::SeqCst);
        }

        *lc = Lifecycle::stopped();
        lc.state = DispatcherState::Running;
        let ctx = RunContext {
            cancel: lc.cancel.clone(),
            tracker: lc.tracker.clone(),
        };
        let this = Arc::clone(self);
        lc.tick_loop = Some(tokio::spawn(async move { this.run_loop(ctx).await }));

        info!(
            max_concurrent = self.capacity(),
            tick_ms = self.config.tick_interval().as_millis() as u64,
            "dispatcher started"
        );
        Ok(())
    }

    /// Enter the running state for on-demand runs only: no tick loop and no
    /// recovery of interrupted runs, so it can share a database with a
    /// serving process.
    pub fn start_manual(&self) -> Result<()> {
        let mut lc = self.lock();
        if lc.state != DispatcherState::Stopped {
            return Err(SchedulerError::AlreadyRunning);
        }
        *lc = Lifecycle::stopped();
        lc.state = DispatcherState::Running;
        debug!("dispatcher started for manual runs");
        Ok(())
    }

    /// Cancel in-flight runs and wait for them, up to the drain timeout.
    /// Idempotent: stopping a stopped dispatcher is a no-op.
    pub async fn stop(&self) {
        let (tracker, tick_loop) = {
            let mut lc = self.lock();
            if lc.state != DispatcherState::Running {
                return;
            }
            lc.state = DispatcherState::Draining;
            lc.cancel.cancel();
            lc.tracker.close();
            (lc.tracker.clone(), lc.tick_loop.take())
        };
        info!(in_flight = tracker.len(), "dispatcher draining");

        if let Some(handle) = tick_loop {
            if let Err(e) = handle.await {
                error!("dispatcher loop ended abnormally: {e}");
            }
        }

        let drain = self.config.drain_timeout();
        if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
            warn!(
                abandoned = tracker.len(),
                drain_timeout_secs = drain.as_secs(),
                "drain timeout expired, abandoning in-flight runs"
            );
        }

        self.lock().state = DispatcherState::Stopped;
        info!("dispatcher stopped");
    }

    /// Main loop: ticks until the lifecycle token is cancelled.
    async fn run_loop(self: Arc<Self>, ctx: RunContext) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let cleanup_every = self.config.cleanup_interval().max(Duration::from_secs(1));
        let mut cleanup =
            tokio::time::interval_at(tokio::time::Instant::now() + cleanup_every, cleanup_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    debug!("dispatcher loop received shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(&ctx, now_ms());
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.prune_history() {
                        error!("history cleanup failed: {e}");
                    }
                }
            }
        }
    }

    /// One pass over the due tasks. Storage errors are logged and the pass
    /// abandoned; the next tick tries again.
    fn tick(self: &Arc<Self>, ctx: &RunContext, now: DateTime<Utc>) {
        let due = match self.store.due_tasks(now) {
            Ok(due) => due,
            Err(e) => {
                error!("dispatcher tick failed to load due tasks: {e}");
                return;
            }
        };

        for (idx, task) in due.iter().enumerate() {
            if self.is_active(&task.id) {
                debug!(task_id = %task.id, "previous run still in flight, skipping");
                continue;
            }
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!(deferred = due.len() - idx, "no free slot, deferring to next tick");
                break;
            };
            self.fire(ctx, task, now, permit);
        }
    }

    fn fire(
        self: &Arc<Self>,
        ctx: &RunContext,
        task: &Task,
        now: DateTime<Utc>,
        permit: OwnedSemaphorePermit,
    ) {
        let executor = self.registry.get(&task.kind);
        let next = schedule::next_after(&task.schedule, now);

        // Advance before running so a slow run is not picked up again. A
        // malformed schedule leaves the task unarmed rather than failing on
        // every tick.
        let next_fire = next.as_ref().ok().copied().flatten();
        match self.store.claim_fire(task, now, next_fire) {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %task.id, "task changed since it was read, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %task.id, "failed to advance task: {e}");
                return;
            }
        }

        let executor = match (executor, next) {
            (Ok(executor), Ok(_)) => executor,
            (Err(e), _) | (_, Err(e)) => {
                warn!(task_id = %task.id, kind = %task.kind, "cannot run task: {e}");
                self.record_failure(&task.id, now, &e.to_string());
                return;
            }
        };

        let guard = ActiveGuard::enter(&self.active, &task.id);
        let this = Arc::clone(self);
        let task = task.clone();
        let cancel = ctx.cancel.child_token();
        ctx.tracker.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            if let Err(e) = this.perform_run(&task, executor, cancel).await {
                error!(task_id = %task.id, "run bookkeeping failed: {e}");
            }
        });
    }

    /// Store a run that failed before the executor could start.
    fn record_failure(&self, task_id: &str, at: DateTime<Utc>, reason: &str) {
        let mut run = RunRecord::start(task_id, at);
        run.finish(RunStatus::Failed, at, "", reason);
        if let Err(e) = self.store.create_run(&run) {
            error!(task_id, "failed to record failed run: {e}");
        }
    }

    /// Run `task` once on the calling task, recording it in the history.
    ///
    /// Rejected with [`SchedulerError::NotRunning`] unless the dispatcher is
    /// running. Waits for a free slot; does not touch next or last fire.
    pub async fn run_now(&self, task_id: &str) -> Result<ExecutionResult> {
        let ctx = {
            let lc = self.lock();
            if lc.state != DispatcherState::Running {
                return Err(SchedulerError::NotRunning);
            }
            RunContext {
                cancel: lc.cancel.clone(),
                tracker: lc.tracker.clone(),
            }
        };

        let task = self.store.get_task(task_id)?;
        let executor = self.registry.get(&task.kind)?;

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(SchedulerError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| SchedulerError::NotRunning)?
            }
        };

        info!(task_id = %task.id, kind = %task.kind, "manual run requested");
        let _guard = ActiveGuard::enter(&self.active, &task.id);
        let cancel = ctx.cancel.child_token();
        let (_, result) = ctx
            .tracker
            .track_future(self.perform_run(&task, executor, cancel))
            .await?;
        drop(permit);
        Ok(result)
    }

    /// Create the run record, invoke the executor (with retries when enabled)
    /// and store the outcome.
    async fn perform_run(
        &self,
        task: &Task,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) -> Result<(RunRecord, ExecutionResult)> {
        let mut run = RunRecord::start(&task.id, now_ms());
        run.id = self.store.create_run(&run)?;
        info!(task_id = %task.id, run_id = run.id, kind = %task.kind, "run started");

        let max_attempts = if self.config.retry_enabled {
            self.config.retry_attempts.max(1)
        } else {
            1
        };

        let mut attempts = 1;
        let result = loop {
            let result = invoke(&executor, &cancel, task).await;
            if result.success || result.cancelled || attempts >= max_attempts {
                break result;
            }
            warn!(
                task_id = %task.id,
                run_id = run.id,
                attempt = attempts,
                "run failed, retrying: {}",
                result.error
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ExecutionResult::cancelled(),
                _ = tokio::time::sleep(self.config.retry_delay()) => {}
            }
            attempts += 1;
        };

        let status = if result.success {
            RunStatus::Completed
        } else if result.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        run.attempts = attempts;
        run.finish(status, now_ms(), result.output.clone(), result.error.clone());
        self.store.update_run(&run)?;

        match status {
            RunStatus::Completed => info!(
                task_id = %task.id,
                run_id = run.id,
                duration_ms = run.duration_ms,
                "run completed"
            ),
            _ => warn!(
                task_id = %task.id,
                run_id = run.id,
                status = %status,
                attempts,
                "run did not complete: {}",
                result.error
            ),
        }
        Ok((run, result))
    }

    /// Apply the history retention policy now. Returns the number of runs
    /// removed.
    pub fn prune_history(&self) -> Result<usize> {
        self.store.prune_runs(
            self.config.history_max_age(),
            self.config.max_execution_history,
        )
    }
}

/// Call the executor on its own task so a panic becomes a failed run
/// instead of a record stuck in `running`.
async fn invoke(
    executor: &Arc<dyn Executor>,
    cancel: &CancellationToken,
    task: &Task,
) -> ExecutionResult {
    let executor = Arc::clone(executor);
    let cancel = cancel.clone();
    let params = task.parameters.clone();
    match tokio::spawn(async move { executor.run(cancel, &params).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => ExecutionResult::failure("executor panicked"),
        Err(e) => ExecutionResult::failure(format!("executor task failed: {e}")),
    }
}
