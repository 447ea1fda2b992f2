//! Command handlers. Each returns `anyhow::Result`; errors end up on stderr
//! with a non-zero exit.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use ragent_core::RagentConfig;
use ragent_scheduler::{
    register_defaults, schedule, Collaborators, Dispatcher, ExecutorRegistry, RunRecord,
    SchedulerHandle, Store, Task,
};
use tracing::info;

use crate::cli::{TaskAction, TaskFields};

/// Open the store and build a handle with the default executors registered.
pub(crate) fn open(config: &RagentConfig) -> anyhow::Result<SchedulerHandle> {
    let path = &config.database.path;
    let store = Store::open(path).with_context(|| format!("cannot open database {path}"))?;

    let registry = Arc::new(ExecutorRegistry::new());
    // Retrieval and model services are provided by embedding applications.
    register_defaults(
        &registry,
        Collaborators::default(),
        config.executors.script.clone(),
    )?;

    let dispatcher = Dispatcher::new(store, registry, config.scheduler.clone());
    Ok(SchedulerHandle::new(Arc::new(dispatcher)))
}

pub(crate) async fn serve(handle: &SchedulerHandle) -> anyhow::Result<()> {
    handle.dispatcher().start()?;
    info!("scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    handle.dispatcher().stop().await;
    Ok(())
}

pub(crate) fn schedule_check(expr: &str, count: usize) -> anyhow::Result<()> {
    schedule::validate(expr)?;
    if expr.trim().is_empty() {
        println!("empty schedule: the task only runs when armed or triggered");
        return Ok(());
    }
    for at in schedule::upcoming(expr, Utc::now(), count)? {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}

pub(crate) async fn task(handle: &SchedulerHandle, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Add {
            kind,
            id,
            fields,
            disabled,
        } => {
            let mut task = Task::new(kind).with_enabled(!disabled);
            if let Some(id) = id {
                task = task.with_id(id);
            }
            apply(&mut task, fields);
            let id = handle.create_task(task)?;
            println!("{id}");
        }

        TaskAction::List { all, json } => {
            let tasks = handle.list_tasks(all)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_tasks(&tasks);
            }
        }

        TaskAction::Show { id, json } => {
            let task = handle.get_task(&id)?;
            let runs = handle.runs_for_task(&id, 5)?;
            if json {
                let value = serde_json::json!({
                    "task": task,
                    "state": task.state_at(Utc::now()),
                    "recent_runs": runs,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_task(&task);
                if !runs.is_empty() {
                    println!();
                    print_runs(&runs);
                }
            }
        }

        TaskAction::Update {
            id,
            kind,
            fields,
            clear_params,
        } => {
            let mut task = handle.get_task(&id)?;
            if let Some(kind) = kind {
                task.kind = kind;
            }
            if clear_params {
                task.parameters.clear();
            }
            apply(&mut task, fields);
            let task = handle.update_task(task)?;
            println!("updated {}", task.id);
        }

        TaskAction::Rm { id } => {
            handle.delete_task(&id)?;
            println!("deleted {id}");
        }

        TaskAction::Enable { id } => {
            handle.set_enabled(&id, true)?;
            println!("enabled {id}");
        }

        TaskAction::Disable { id } => {
            handle.set_enabled(&id, false)?;
            println!("disabled {id}");
        }

        TaskAction::Run { id } => {
            handle.dispatcher().start_manual()?;
            let result = handle.run_now(&id).await;
            handle.dispatcher().stop().await;
            let result = result?;
            if !result.output.is_empty() {
                println!("{}", result.output.trim_end());
            }
            if !result.success {
                bail!("run failed: {}", result.error);
            }
        }

        TaskAction::Arm { id, at } => {
            let at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid RFC 3339 instant `{raw}`"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            handle.schedule_once(&id, at)?;
            println!("armed {id} for {}", at.to_rfc3339());
        }

        TaskAction::History { id, limit, json } => {
            let runs = handle.runs_for_task(&id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_runs(&runs);
            }
        }
    }
    Ok(())
}

fn apply(task: &mut Task, fields: TaskFields) {
    if let Some(schedule) = fields.schedule {
        task.schedule = schedule;
    }
    if let Some(description) = fields.description {
        task.description = description;
    }
    if let Some(priority) = fields.priority {
        task.priority = priority;
    }
    task.parameters.extend(fields.params);
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("no tasks");
        return;
    }
    let now = Utc::now();
    println!(
        "{:<36}  {:<9}  {:>4}  {:<8}  {:<19}  SCHEDULE",
        "ID", "KIND", "PRI", "STATE", "NEXT FIRE"
    );
    for t in tasks {
        println!(
            "{:<36}  {:<9}  {:>4}  {:<8}  {:<19}  {}",
            t.id,
            t.kind,
            t.priority,
            t.state_at(now).to_string(),
            fmt_time(t.next_fire),
            if t.schedule.is_empty() { "(one-shot)" } else { t.schedule.as_str() },
        );
    }
}

fn print_task(t: &Task) {
    println!("id:          {}", t.id);
    println!("kind:        {}", t.kind);
    println!("state:       {}", t.state_at(Utc::now()));
    println!("schedule:    {}", if t.schedule.is_empty() { "(one-shot)" } else { t.schedule.as_str() });
    println!("priority:    {}", t.priority);
    if !t.description.is_empty() {
        println!("description: {}", t.description);
    }
    println!("next fire:   {}", fmt_time(t.next_fire));
    println!("last fire:   {}", fmt_time(t.last_fire));
    for (key, value) in &t.parameters {
        println!("param:       {key}={value}");
    }
}

fn print_runs(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("no runs");
        return;
    }
    println!(
        "{:>6}  {:<19}  {:<9}  {:>9}  DETAIL",
        "RUN", "STARTED", "STATUS", "MS"
    );
    for r in runs {
        let detail = if r.error.is_empty() { r.output.as_str() } else { r.error.as_str() };
        let first_line = detail.lines().next().unwrap_or("");
        println!(
            "{:>6}  {:<19}  {:<9}  {:>9}  {}",
            r.id,
            fmt_time(Some(r.started_at)),
            r.status.to_string(),
            r.duration_ms,
            first_line
        );
    }
}
