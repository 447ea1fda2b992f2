//! `tool-call` executor.
//!
//! *Direct* mode (`tool` present) invokes one tool with the JSON object in
//! `args`. *Intelligent* mode hands `message` (or `query`) and the tool list
//! to the chat model, executes whatever tools it asks for, feeds the results
//! back and repeats until the model stops asking:
//!
//! prompt → model → tool_use? → run tools → inject results → model → …

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::params::required;
use crate::collab::{ChatModel, ChatRequest, ChatResponse, ToolCall, ToolHost, ToolOutput};
use crate::error::Result;
use crate::executor::{invalid_params, ExecutionResult, Executor};
use crate::types::Parameters;

pub const KIND: &str = "tool-call";

/// Upper bound on model round-trips for one run.
const MAX_ITERATIONS: usize = 25;

const SYSTEM_PROMPT: &str = "You are running as a scheduled background task. \
     Use the available tools to complete the request, then reply with a short summary.";

enum Mode<'a> {
    Direct { tool: &'a str, args: Value },
    Intelligent { message: &'a str },
}

pub struct ToolCallExecutor {
    tools: Option<Arc<dyn ToolHost>>,
    model: Option<Arc<dyn ChatModel>>,
}

impl ToolCallExecutor {
    pub fn new(tools: Option<Arc<dyn ToolHost>>, model: Option<Arc<dyn ChatModel>>) -> Self {
        Self { tools, model }
    }

    fn mode(params: &Parameters) -> Result<Mode<'_>> {
        if params.contains_key("tool") {
            let tool = required(KIND, params, "tool")?;
            let args = match params.get("args").map(|a| a.trim()) {
                None | Some("") => json!({}),
                Some(raw) => match serde_json::from_str::<Value>(raw) {
                    Ok(v @ Value::Object(_)) => v,
                    Ok(_) => return Err(invalid_params(KIND, "`args` must be a JSON object")),
                    Err(e) => return Err(invalid_params(KIND, format!("`args` is not valid JSON: {e}"))),
                },
            };
            return Ok(Mode::Direct { tool, args });
        }

        let message = required(KIND, params, "message")
            .or_else(|_| required(KIND, params, "query"))
            .map_err(|_| invalid_params(KIND, "either `tool` or `message` is required"))?;
        Ok(Mode::Intelligent { message })
    }

    async fn run_direct(
        &self,
        cancel: &CancellationToken,
        tool: &str,
        args: Value,
    ) -> ExecutionResult {
        let Some(host) = self.tools.as_ref() else {
            return ExecutionResult::failure("tool service not configured");
        };
        debug!(tool, "direct tool call");
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionResult::cancelled(),
            out = host.call_tool(tool, args) => out,
        };
        match output {
            Ok(ToolOutput { content, is_error: false }) => ExecutionResult::success(content),
            Ok(ToolOutput { content, is_error: true }) => {
                ExecutionResult::failure_with_output(content, format!("tool {tool} reported an error"))
            }
            Err(e) => ExecutionResult::failure(format!("tool {tool} failed: {e}")),
        }
    }

    async fn run_intelligent(&self, cancel: &CancellationToken, message: &str) -> ExecutionResult {
        let Some(model) = self.model.as_ref() else {
            return ExecutionResult::failure("LLM service not configured");
        };
        let Some(host) = self.tools.as_ref() else {
            return ExecutionResult::failure("tool service not configured");
        };

        let specs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionResult::cancelled(),
            specs = host.list_tools() => specs,
        };
        let specs = match specs {
            Ok(specs) => specs,
            Err(e) => return ExecutionResult::failure(format!("listing tools failed: {e}")),
        };

        let mut messages = vec![json!({ "role": "user", "content": message })];
        let mut used: Vec<String> = Vec::new();
        let mut last: Option<ChatResponse> = None;

        for iteration in 0..MAX_ITERATIONS {
            let request = ChatRequest {
                system: SYSTEM_PROMPT.to_string(),
                messages: messages.clone(),
                tools: specs.clone(),
            };
            debug!(iteration, "tool loop iteration");

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ExecutionResult::cancelled(),
                r = model.chat(request) => r,
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => return ExecutionResult::failure(format!("model call failed: {e}")),
            };

            if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
                info!(iteration, tools_used = used.len(), "tool loop complete");
                return ExecutionResult::success(summarise(&response.content, &used));
            }

            let mut assistant = Vec::new();
            if !response.content.is_empty() {
                assistant.push(json!({ "type": "text", "text": response.content }));
            }
            for call in &response.tool_calls {
                assistant.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            messages.push(json!({ "role": "assistant", "content": assistant }));

            let mut results = Vec::new();
            for call in &response.tool_calls {
                if !used.contains(&call.name) {
                    used.push(call.name.clone());
                }
                let out = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ExecutionResult::cancelled(),
                    out = execute_tool(host.as_ref(), call) => out,
                };
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": out.content,
                    "is_error": out.is_error,
                }));
            }
            messages.push(json!({ "role": "user", "content": results }));

            last = Some(response);
        }

        warn!(max_iterations = MAX_ITERATIONS, "tool loop hit maximum iterations");
        match last {
            Some(resp) => ExecutionResult::success(summarise(&resp.content, &used)),
            None => ExecutionResult::failure(format!(
                "tool loop exceeded {MAX_ITERATIONS} iterations without a final response"
            )),
        }
    }
}

async fn execute_tool(host: &dyn ToolHost, call: &ToolCall) -> ToolOutput {
    debug!(tool = %call.name, "executing tool");
    match host.call_tool(&call.name, call.input.clone()).await {
        Ok(out) => out,
        Err(e) => ToolOutput::error(e.to_string()),
    }
}

fn summarise(text: &str, used: &[String]) -> String {
    if used.is_empty() {
        return text.to_string();
    }
    format!("{text}\n\nTools used: {}", used.join(", "))
}

#[async_trait]
impl Executor for ToolCallExecutor {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<()> {
        Self::mode(params).map(|_| ())
    }

    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult {
        match Self::mode(params) {
            Ok(Mode::Direct { tool, args }) => self.run_direct(&cancel, tool, args).await,
            Ok(Mode::Intelligent { message }) => self.run_intelligent(&cancel, message).await,
            Err(e) => ExecutionResult::failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollaboratorError, ToolSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type CResult<T> = std::result::Result<T, CollaboratorError>;

    #[derive(Default)]
    struct Tools {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolHost for Tools {
        async fn list_tools(&self) -> CResult<Vec<ToolSpec>> {
            Ok(vec![ToolSpec {
                name: "clock".into(),
                description: "current time".into(),
                input_schema: json!({ "type": "object" }),
            }])
        }

        async fn call_tool(&self, name: &str, args: Value) -> CResult<ToolOutput> {
            self.calls.lock().unwrap().push((name.to_string(), args));
            match name {
                "clock" => Ok(ToolOutput::success("12:00")),
                "broken" => Ok(ToolOutput::error("disk full")),
                other => Err(CollaboratorError::ToolNotFound(other.to_string())),
            }
        }
    }

    /// Asks for `clock` once, then answers.
    #[derive(Default)]
    struct Model {
        turns: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for Model {
        async fn chat(&self, request: ChatRequest) -> CResult<ChatResponse> {
            assert_eq!(request.tools.len(), 1);
            if self.turns.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ChatResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "c1".into(),
                        name: "clock".into(),
                        input: json!({}),
                    }],
                    stop_reason: "tool_use".into(),
                })
            } else {
                assert_eq!(request.messages.len(), 3);
                Ok(ChatResponse {
                    content: "It is noon.".into(),
                    tool_calls: vec![],
                    stop_reason: "end_turn".into(),
                })
            }
        }
    }

    /// Never stops asking for tools.
    struct Looping;

    #[async_trait]
    impl ChatModel for Looping {
        async fn chat(&self, _: ChatRequest) -> CResult<ChatResponse> {
            Ok(ChatResponse {
                content: "still working".into(),
                tool_calls: vec![ToolCall {
                    id: "x".into(),
                    name: "clock".into(),
                    input: json!({}),
                }],
                stop_reason: "tool_use".into(),
            })
        }
    }

    /// Every tool call hangs for five seconds.
    struct SlowTools;

    #[async_trait]
    impl ToolHost for SlowTools {
        async fn list_tools(&self) -> CResult<Vec<ToolSpec>> {
            Tools::default().list_tools().await
        }

        async fn call_tool(&self, _: &str, _: Value) -> CResult<ToolOutput> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(ToolOutput::success("late"))
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn validation_rules() {
        let exec = ToolCallExecutor::new(None, None);
        assert!(exec.validate(&Parameters::new()).is_err());
        assert!(exec.validate(&params(&[("tool", "")])).is_err());
        assert!(exec.validate(&params(&[("tool", "clock"), ("args", "[1,2]")])).is_err());
        assert!(exec.validate(&params(&[("tool", "clock"), ("args", "{oops")])).is_err());
        assert!(exec.validate(&params(&[("tool", "clock"), ("args", r#"{"tz":"UTC"}"#)])).is_ok());
        assert!(exec.validate(&params(&[("tool", "clock")])).is_ok());
        assert!(exec.validate(&params(&[("message", "what time is it")])).is_ok());
        assert!(exec.validate(&params(&[("query", "what time is it")])).is_ok());
    }

    #[tokio::test]
    async fn direct_mode_passes_args_through() {
        let tools = Arc::new(Tools::default());
        let exec = ToolCallExecutor::new(Some(tools.clone()), None);
        let r = exec
            .run(
                CancellationToken::new(),
                &params(&[("tool", "clock"), ("args", r#"{"tz":"UTC"}"#)]),
            )
            .await;
        assert!(r.success);
        assert_eq!(r.output, "12:00");
        assert_eq!(tools.calls.lock().unwrap()[0].1, json!({ "tz": "UTC" }));
    }

    #[tokio::test]
    async fn direct_mode_tool_error_fails_the_run() {
        let exec = ToolCallExecutor::new(Some(Arc::new(Tools::default())), None);
        let r = exec.run(CancellationToken::new(), &params(&[("tool", "broken")])).await;
        assert!(!r.success);
        assert_eq!(r.output, "disk full");

        let r = exec.run(CancellationToken::new(), &params(&[("tool", "ghost")])).await;
        assert!(!r.success);
        assert!(r.error.contains("tool not found: ghost"));
    }

    #[tokio::test]
    async fn intelligent_mode_runs_the_loop() {
        let tools = Arc::new(Tools::default());
        let exec = ToolCallExecutor::new(Some(tools.clone()), Some(Arc::new(Model::default())));
        let r = exec
            .run(CancellationToken::new(), &params(&[("message", "what time is it")]))
            .await;
        assert!(r.success, "{}", r.error);
        assert_eq!(r.output, "It is noon.\n\nTools used: clock");
        assert_eq!(tools.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn intelligent_mode_is_bounded() {
        let tools = Arc::new(Tools::default());
        let exec = ToolCallExecutor::new(Some(tools.clone()), Some(Arc::new(Looping)));
        let r = exec.run(CancellationToken::new(), &params(&[("query", "go")])).await;
        assert!(r.success);
        assert!(r.output.starts_with("still working"));
        assert_eq!(tools.calls.lock().unwrap().len(), MAX_ITERATIONS);
    }

    #[tokio::test]
    async fn missing_collaborators_fail_with_a_message() {
        let exec = ToolCallExecutor::new(None, None);
        let r = exec.run(CancellationToken::new(), &params(&[("message", "hi")])).await;
        assert_eq!(r.error, "LLM service not configured");
        let r = exec.run(CancellationToken::new(), &params(&[("tool", "clock")])).await;
        assert_eq!(r.error, "tool service not configured");
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_loop() {
        let exec = ToolCallExecutor::new(Some(Arc::new(Tools::default())), Some(Arc::new(Looping)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = exec.run(cancel, &params(&[("message", "go")])).await;
        assert!(r.cancelled);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_slow_tool_mid_call() {
        let exec = ToolCallExecutor::new(Some(Arc::new(SlowTools)), Some(Arc::new(Model::default())));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let r = exec.run(cancel, &params(&[("message", "what time is it")])).await;
        assert!(r.cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
