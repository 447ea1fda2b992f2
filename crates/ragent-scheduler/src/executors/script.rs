//! `script` executor: runs an inline command or a script file under a shell.
//!
//! stdout and stderr are merged into the run output and the exit code decides
//! success. The child is killed when the run is cancelled or its timeout
//! expires.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ragent_core::ScriptConfig;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::params::{positive_int_param, required};
use crate::error::Result;
use crate::executor::{invalid_params, ExecutionResult, Executor};
use crate::types::Parameters;

pub const KIND: &str = "script";

/// A fully resolved invocation.
#[derive(Debug)]
struct Invocation {
    shell: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

pub struct ScriptExecutor {
    config: ScriptConfig,
}

impl ScriptExecutor {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    fn default_shell(&self) -> String {
        match &self.config.shell {
            Some(shell) if !shell.trim().is_empty() => shell.clone(),
            _ if cfg!(windows) => "cmd".to_string(),
            _ => "sh".to_string(),
        }
    }

    fn plan(&self, params: &Parameters) -> Result<Invocation> {
        let script = required(KIND, params, "script")?;
        let as_file = looks_like_path(script);
        if as_file && !Path::new(script).is_file() {
            return Err(invalid_params(KIND, format!("script file not found: {script}")));
        }

        let workdir = match params.get("workdir").map(|w| w.trim()).filter(|w| !w.is_empty()) {
            Some(dir) if !Path::new(dir).is_dir() => {
                return Err(invalid_params(KIND, format!("workdir is not a directory: {dir}")))
            }
            Some(dir) => Some(PathBuf::from(dir)),
            None => None,
        };

        let env = match params.get("env") {
            Some(raw) => parse_env(raw).map_err(|reason| invalid_params(KIND, reason))?,
            None => Vec::new(),
        };

        let timeout_secs =
            positive_int_param(KIND, params, "timeout")?.unwrap_or(self.config.timeout_secs);

        let shell = match params.get("shell").map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(shell) => shell.to_string(),
            None => self.default_shell(),
        };
        let args = shell_args(&shell, script, as_file);

        Ok(Invocation {
            shell,
            args,
            workdir,
            env,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<()> {
        self.plan(params).map(|_| ())
    }

    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult {
        let inv = match self.plan(params) {
            Ok(inv) => inv,
            Err(e) => return ExecutionResult::failure(e.to_string()),
        };

        let mut cmd = Command::new(&inv.shell);
        cmd.args(&inv.args)
            .envs(inv.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &inv.workdir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failure(format!("failed to start {}: {e}", inv.shell)),
        };
        debug!(shell = %inv.shell, pid = ?child.id(), "script started");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("script cancelled, killing child");
                return ExecutionResult::cancelled();
            }
            _ = tokio::time::sleep(inv.timeout) => {
                warn!(timeout_secs = inv.timeout.as_secs(), "script timed out, killing child");
                return ExecutionResult::failure(format!(
                    "script timed out after {}s",
                    inv.timeout.as_secs()
                ));
            }
            out = child.wait_with_output() => out,
        };

        let output = match output {
            Ok(out) => out,
            Err(e) => return ExecutionResult::failure(format!("waiting for script failed: {e}")),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        let text = truncate_middle(
            &merge_output(&stdout, &stderr, code),
            self.config.max_output_chars,
        );

        match code {
            Some(0) => ExecutionResult::success(text),
            Some(n) => ExecutionResult::failure_with_output(text, format!("script exited with code {n}")),
            None => ExecutionResult::failure_with_output(text, "script terminated by signal"),
        }
    }
}

/// A bare token with a path separator and an extension names a file;
/// anything else is an inline command.
fn looks_like_path(script: &str) -> bool {
    (script.contains('/') || script.contains('\\'))
        && !script.chars().any(char::is_whitespace)
        && Path::new(script).extension().is_some()
}

fn shell_args(shell: &str, script: &str, as_file: bool) -> Vec<String> {
    // Either separator, so `C:\...\cmd.exe` is recognised on any host.
    let name = shell.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(shell);
    let stem = name.split('.').next().unwrap_or(name);
    let is_cmd = stem.eq_ignore_ascii_case("cmd");
    match (is_cmd, as_file) {
        (true, _) => vec!["/C".into(), script.into()],
        (false, true) => vec![script.into()],
        (false, false) => vec!["-c".into(), script.into()],
    }
}

/// `KEY=value,KEY2=value2` → pairs. Empty items are ignored.
fn parse_env(raw: &str) -> std::result::Result<Vec<(String, String)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("bad env entry `{item}`, expected KEY=value")),
        })
        .collect()
}

fn merge_output(stdout: &str, stderr: &str, code: Option<i32>) -> String {
    let mut out = String::from(stdout);
    if !stderr.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("[stderr]\n");
        out.push_str(stderr);
    }
    match code {
        Some(0) => {}
        Some(n) => {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("[exit code: {n}]"));
        }
        None => out.push_str("\n[terminated by signal]"),
    }
    out
}

/// Keep the head and tail of `text`, dropping the middle once it exceeds
/// `max_chars` characters. `0` disables the limit.
fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if max_chars == 0 || total <= max_chars {
        return text.to_string();
    }
    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    format!(
        "{head}\n... [{} characters omitted] ...\n{tail}",
        total - 2 * keep
    )
}
