//! `ragent-scheduler`: durable task scheduler with pluggable executors.
//!
//! # Overview
//!
//! Tasks live in a SQLite `tasks` table and every execution is recorded in
//! `task_executions`. The [`dispatcher::Dispatcher`] polls the store each
//! tick, advances due tasks to their next cron fire and runs them on worker
//! tasks bounded by a semaphore. The [`handle::SchedulerHandle`] is the
//! in-process API for creating, editing and triggering tasks.
//!
//! # Shipped executors
//!
//! | Kind        | Does                                                  |
//! |-------------|-------------------------------------------------------|
//! | `query`     | Ask the retrieval service a question                  |
//! | `ingest`    | Ask the retrieval service to index a path             |
//! | `tool-call` | Call one tool, or let the chat model drive the tools  |
//! | `script`    | Run a shell command or script file                    |

pub mod collab;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod executors;
pub mod handle;
pub mod schedule;
pub mod store;
pub mod types;

pub use dispatcher::{Dispatcher, DispatcherState, DispatcherStatus};
pub use error::{Result, SchedulerError};
pub use executor::{ExecutionResult, Executor, ExecutorRegistry};
pub use executors::{register_defaults, Collaborators};
pub use handle::SchedulerHandle;
pub use store::Store;
pub use types::{Parameters, RunRecord, RunStatus, Task, TaskState};
