// Control surface behaviour that does not need the dispatcher loop.

mod common;

use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};
use common::{config, handle_with, EchoRag, SleepExecutor};
use ragent_scheduler::executors::QueryExecutor;
use ragent_scheduler::{
    DispatcherState, RunRecord, RunStatus, SchedulerError, SchedulerHandle, Task, TaskState,
};

fn handle() -> SchedulerHandle {
    handle_with(
        config(2),
        vec![
            Arc::new(QueryExecutor::new(Some(Arc::new(EchoRag)))),
            Arc::new(SleepExecutor::default()),
        ],
    )
}

fn query(text: &str) -> Task {
    Task::new("query").with_param("query", text)
}

#[test]
fn create_computes_first_fire_from_schedule() {
    let h = handle();
    let before = Utc::now();
    let id = h.create_task(query("q").with_schedule("@hourly")).unwrap();
    let task = h.get_task(&id).unwrap();
    let next = task.next_fire.unwrap();
    assert!(next > before);
    assert!(next <= before + Duration::hours(1));
    assert_eq!(task.state_at(Utc::now()), TaskState::Pending);
}

#[test]
fn duplicate_ids_are_rejected() {
    let h = handle();
    h.create_task(query("a").with_id("fixed")).unwrap();
    let err = h.create_task(query("b").with_id("fixed")).unwrap_err();
    assert!(matches!(err, SchedulerError::Duplicate { id } if id == "fixed"));
}

#[test]
fn update_keeps_fire_times_unless_schedule_changes() {
    let h = handle();
    let id = h.create_task(query("q").with_schedule("0 0 1 1 *")).unwrap();
    let original = h.get_task(&id).unwrap();

    let mut edit = original.clone();
    edit.description = "new words".into();
    edit.next_fire = None; // ignored
    let updated = h.update_task(edit).unwrap();
    assert_eq!(updated.description, "new words");
    assert_eq!(updated.next_fire, original.next_fire);
    assert_eq!(updated.created_at, original.created_at);

    let mut edit = updated.clone();
    edit.schedule = "*/5 * * * *".into();
    let updated = h.update_task(edit).unwrap();
    assert!(updated.next_fire.unwrap() <= Utc::now() + Duration::minutes(5));

    let mut edit = updated;
    edit.schedule = String::new();
    assert!(h.update_task(edit).unwrap().next_fire.is_none());
}

#[test]
fn update_validates_like_create() {
    let h = handle();
    let id = h.create_task(query("q")).unwrap();
    let mut edit = h.get_task(&id).unwrap();
    edit.schedule = "61 * * * *".into();
    assert!(matches!(h.update_task(edit), Err(SchedulerError::InvalidSchedule(_))));

    let mut edit = h.get_task(&id).unwrap();
    edit.parameters.clear();
    assert!(matches!(
        h.update_task(edit),
        Err(SchedulerError::InvalidParameters { .. })
    ));

    let missing = query("q").with_id("ghost");
    assert!(matches!(h.update_task(missing), Err(SchedulerError::NotFound { .. })));
}

#[test]
fn reenabling_recomputes_next_fire() {
    let h = handle();
    let id = h.create_task(query("q").with_schedule("* * * * *")).unwrap();
    h.set_enabled(&id, false).unwrap();
    assert_eq!(h.get_task(&id).unwrap().state_at(Utc::now()), TaskState::Disabled);

    // pretend the task sat disabled past several fires
    let stale = Utc::now() - Duration::hours(3);
    h.schedule_once(&id, stale).unwrap();

    h.set_enabled(&id, true).unwrap();
    let task = h.get_task(&id).unwrap();
    assert!(task.enabled);
    assert!(task.next_fire.unwrap() > Utc::now() - Duration::seconds(1));
}

#[test]
fn schedule_once_arms_a_one_shot_task() {
    let h = handle();
    let id = h.create_task(query("q")).unwrap();
    let now = Utc::now();
    assert_eq!(h.get_task(&id).unwrap().state_at(now), TaskState::Pending);

    h.schedule_once(&id, now - Duration::seconds(1)).unwrap();
    let task = h.get_task(&id).unwrap();
    assert_eq!(task.next_fire, Some((now - Duration::seconds(1)).trunc_subsecs(3)));
    assert_eq!(task.state_at(now), TaskState::Due);

    assert!(matches!(
        h.schedule_once("ghost", now),
        Err(SchedulerError::NotFound { .. })
    ));
}

#[test]
fn delete_then_get_is_not_found() {
    let h = handle();
    let id = h.create_task(query("q")).unwrap();
    h.delete_task(&id).unwrap();
    assert!(matches!(h.get_task(&id), Err(SchedulerError::NotFound { .. })));
    assert!(matches!(h.delete_task(&id), Err(SchedulerError::NotFound { .. })));
    assert!(h.runs_for_task(&id, 0).unwrap().is_empty());
}

#[test]
fn list_orders_by_priority_and_hides_disabled() {
    let h = handle();
    let low = h.create_task(query("low").with_priority(1)).unwrap();
    let high = h.create_task(query("high").with_priority(9)).unwrap();
    let off = h.create_task(query("off").with_enabled(false)).unwrap();

    let enabled: Vec<String> = h.list_tasks(false).unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(enabled, vec![high.clone(), low.clone()]);
    let all = h.list_tasks(true).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|t| t.id == off));
}

#[test]
fn prune_history_applies_the_count_limit() {
    let mut cfg = config(2);
    cfg.max_execution_history = 2;
    let h = handle_with(cfg, vec![Arc::new(QueryExecutor::new(None))]);
    let id = h.create_task(query("q")).unwrap();
    let store = h.dispatcher().store();
    let base = Utc::now() - Duration::minutes(10);
    for i in 0..5 {
        let mut run = RunRecord::start(&id, base + Duration::minutes(i));
        run.finish(RunStatus::Completed, base + Duration::minutes(i), "", "");
        store.create_run(&run).unwrap();
    }

    assert_eq!(h.prune_history().unwrap(), 3);
    assert_eq!(h.runs_for_task(&id, 0).unwrap().len(), 2);
    assert_eq!(h.runs_for_task(&id, 1).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_now_leaves_fire_times_alone() {
    let h = handle();
    let id = h.create_task(query("ping").with_schedule("0 0 1 1 *")).unwrap();
    let before = h.get_task(&id).unwrap();

    assert!(matches!(h.run_now(&id).await, Err(SchedulerError::NotRunning)));

    h.dispatcher().start().unwrap();
    assert_eq!(h.status().state, DispatcherState::Running);
    let result = h.run_now(&id).await.unwrap();
    assert_eq!(result.output, "echo: ping");
    assert!(matches!(h.run_now("ghost").await, Err(SchedulerError::NotFound { .. })));
    h.dispatcher().stop().await;

    let after = h.get_task(&id).unwrap();
    assert_eq!(after.next_fire, before.next_fire);
    assert_eq!(after.last_fire, before.last_fire);

    let runs = h.runs_for_task(&id, 0).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(h.get_run(runs[0].id).unwrap(), runs[0]);
}
