use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Executor-specific key/value inputs. Opaque to the scheduler.
pub type Parameters = BTreeMap<String, String>;

/// Current wall-clock time truncated to the storage precision (milliseconds).
pub fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Primary key. UUID v4 unless the caller picked one.
    pub id: String,
    /// Tag naming the executor that runs this task (`query`, `script`, …).
    pub kind: String,
    /// Cron expression; empty for one-shot tasks.
    pub schedule: String,
    pub parameters: Parameters,
    pub description: String,
    /// Higher values are dispatched first when several tasks are due.
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Next planned fire. `None` means the task only runs when armed or triggered.
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
}

impl Task {
    /// New enabled one-shot task with a fresh id and both timestamps set to now.
    pub fn new(kind: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            schedule: String::new(),
            parameters: Parameters::new(),
            description: String::new(),
            priority: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
            next_fire: None,
            last_fire: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_next_fire(mut self, next_fire: Option<DateTime<Utc>>) -> Self {
        self.next_fire = next_fire;
        self
    }

    /// Scheduling state as seen at `now`. A task that is currently executing
    /// still reports `Pending` or `Due` here; the run history tracks execution.
    pub fn state_at(&self, now: DateTime<Utc>) -> TaskState {
        if !self.enabled {
            return TaskState::Disabled;
        }
        match self.next_fire {
            Some(at) if at <= now => TaskState::Due,
            _ => TaskState::Pending,
        }
    }
}

/// Scheduling state derived from `enabled` and `next_fire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Disabled,
    /// Enabled, next fire in the future or unset.
    Pending,
    Due,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Disabled => "disabled",
            TaskState::Pending => "pending",
            TaskState::Due => "due",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution attempt of a task, as stored in `task_executions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Assigned by the store on insert; 0 until then.
    pub id: i64,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the run is in flight.
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub output: String,
    pub error: String,
    /// Executor invocations folded into this record (>1 only with retries).
    pub attempts: u32,
}

impl RunRecord {
    /// A fresh in-flight record for `task_id` starting at `started_at`.
    pub fn start(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            started_at: started_at.trunc_subsecs(3),
            ended_at: None,
            duration_ms: 0,
            status: RunStatus::Running,
            output: String::new(),
            error: String::new(),
            attempts: 1,
        }
    }

    /// Move the record to a terminal state, stamping end time and duration.
    ///
    /// The end is clamped to the start so a clock step backwards never yields
    /// a negative duration.
    pub fn finish(
        &mut self,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        output: impl Into<String>,
        error: impl Into<String>,
    ) {
        let ended_at = ended_at.trunc_subsecs(3).max(self.started_at);
        self.status = status;
        self.ended_at = Some(ended_at);
        self.duration_ms = (ended_at - self.started_at).num_milliseconds();
        self.output = output.into();
        self.error = error.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn run_status_round_trips_through_text() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("exploded".parse::<RunStatus>().is_err());
    }

    #[test]
    fn finish_computes_duration_in_millis() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut run = RunRecord::start("t1", start);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.ended_at.is_none());

        run.finish(
            RunStatus::Completed,
            start + Duration::milliseconds(1_234),
            "ok",
            "",
        );
        assert_eq!(run.duration_ms, 1_234);
        assert!(run.status.is_terminal());
    }

    #[test]
    fn finish_never_produces_negative_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut run = RunRecord::start("t1", start);
        run.finish(RunStatus::Failed, start - Duration::seconds(5), "", "clock skew");
        assert_eq!(run.duration_ms, 0);
        assert_eq!(run.ended_at, Some(start));
    }

    #[test]
    fn state_follows_enabled_and_next_fire() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let task = Task::new("query");
        assert_eq!(task.state_at(now), TaskState::Pending);

        let due = task.clone().with_next_fire(Some(now));
        assert_eq!(due.state_at(now), TaskState::Due);

        let later = task.clone().with_next_fire(Some(now + Duration::minutes(1)));
        assert_eq!(later.state_at(now), TaskState::Pending);

        let off = due.with_enabled(false);
        assert_eq!(off.state_at(now), TaskState::Disabled);
    }
}
