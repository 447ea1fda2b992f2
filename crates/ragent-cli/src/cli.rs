//! Command-line definitions for `ragent`.

use clap::{Args, Parser, Subcommand};

/// Durable task scheduler for ragent.
#[derive(Parser)]
#[command(name = "ragent")]
#[command(about = "Schedule and run query, ingest, tool-call and script tasks")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: <config dir>/ragent/ragent.toml)
    #[arg(short, long, env = "RAGENT_CONFIG", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the dispatcher in the foreground until Ctrl-C
    Serve,

    /// Task management
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run history maintenance
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Schedule expression tools
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum TaskAction {
    /// Create a task
    Add {
        /// Executor kind (query, ingest, tool-call, script)
        #[arg(long)]
        kind: String,

        /// Explicit id (default: random UUID)
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        fields: TaskFields,

        /// Create the task disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List tasks
    List {
        /// Include disabled tasks
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show one task and its latest runs
    Show {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Change a task; unspecified fields are kept
    Update {
        id: String,

        #[arg(long)]
        kind: Option<String>,

        #[command(flatten)]
        fields: TaskFields,

        /// Drop all existing parameters before applying --param
        #[arg(long)]
        clear_params: bool,
    },

    /// Delete a task and its history
    Rm { id: String },

    Enable { id: String },

    Disable { id: String },

    /// Run a task now and print its output
    Run { id: String },

    /// Arm a task to fire once at the given instant
    Arm {
        id: String,

        /// RFC 3339 instant (default: now)
        #[arg(long)]
        at: Option<String>,
    },

    /// Show recent runs of a task
    History {
        id: String,

        /// Number of runs, 0 for all
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
}

/// Fields shared by `task add` and `task update`.
#[derive(Args)]
pub(crate) struct TaskFields {
    /// Cron expression; empty for a one-shot task
    #[arg(long)]
    pub schedule: Option<String>,

    /// Executor parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    #[arg(long)]
    pub description: Option<String>,

    /// Higher runs first when several tasks are due
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,
}

#[derive(Subcommand)]
pub(crate) enum HistoryAction {
    /// Apply the retention policy now
    Prune,
}

#[derive(Subcommand)]
pub(crate) enum ScheduleAction {
    /// Validate an expression and preview its next fires
    Check {
        expr: String,

        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_add() {
        let cli = Cli::try_parse_from([
            "ragent",
            "task",
            "add",
            "--kind",
            "script",
            "--schedule",
            "*/5 * * * *",
            "--param",
            "script=echo a=b",
            "--param",
            "timeout=30",
            "--priority",
            "-3",
        ])
        .unwrap();
        let Commands::Task { action: TaskAction::Add { kind, fields, disabled, .. } } = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(kind, "script");
        assert!(!disabled);
        assert_eq!(fields.priority, Some(-3));
        assert_eq!(fields.params[0], ("script".to_string(), "echo a=b".to_string()));
        assert_eq!(fields.params.len(), 2);
    }

    #[test]
    fn rejects_bad_param() {
        assert!(Cli::try_parse_from(["ragent", "task", "add", "--kind", "q", "--param", "oops"]).is_err());
    }

    #[test]
    fn definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
