//! `query` executor: asks the retrieval service a question.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::params::{bool_param, positive_int_param, required};
use crate::collab::{RagQuery, RagService};
use crate::error::Result;
use crate::executor::{ExecutionResult, Executor};
use crate::types::Parameters;

pub const KIND: &str = "query";

pub struct QueryExecutor {
    rag: Option<Arc<dyn RagService>>,
}

impl QueryExecutor {
    pub fn new(rag: Option<Arc<dyn RagService>>) -> Self {
        Self { rag }
    }

    fn build(params: &Parameters) -> Result<RagQuery> {
        let question = required(KIND, params, "query")?.to_string();
        let top_k = positive_int_param(KIND, params, "top-k")?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
        Ok(RagQuery {
            question,
            top_k,
            show_sources: bool_param(KIND, params, "show-sources", false)?,
            use_tools: bool_param(KIND, params, "mcp", false)?,
        })
    }
}

#[async_trait]
impl Executor for QueryExecutor {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<()> {
        Self::build(params).map(|_| ())
    }

    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult {
        let query = match Self::build(params) {
            Ok(q) => q,
            Err(e) => return ExecutionResult::failure(e.to_string()),
        };
        let Some(rag) = self.rag.as_ref() else {
            return ExecutionResult::failure("RAG service not configured");
        };

        debug!(top_k = ?query.top_k, mcp = query.use_tools, "running scheduled query");
        let show_sources = query.show_sources;
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionResult::cancelled(),
            answer = rag.query(query) => answer,
        };

        match answer {
            Ok(answer) => {
                let mut output = answer.answer;
                if show_sources && !answer.sources.is_empty() {
                    output.push_str("\n\nSources:");
                    for source in &answer.sources {
                        output.push_str("\n- ");
                        output.push_str(source);
                    }
                }
                ExecutionResult::success(output)
            }
            Err(e) => ExecutionResult::failure(format!("query failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollaboratorError, IngestReport, RagAnswer};
    use crate::error::SchedulerError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRag {
        seen: Mutex<Vec<RagQuery>>,
    }

    #[async_trait]
    impl RagService for FakeRag {
        async fn query(&self, query: RagQuery) -> std::result::Result<RagAnswer, CollaboratorError> {
            let answer = format!("answer to {}", query.question);
            self.seen.lock().unwrap().push(query);
            Ok(RagAnswer {
                answer,
                sources: vec!["notes/a.md".into()],
            })
        }

        async fn ingest(&self, _: &str, _: bool) -> std::result::Result<IngestReport, CollaboratorError> {
            unreachable!()
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_parameters_are_rejected() {
        let exec = QueryExecutor::new(None);
        let err = exec.validate(&Parameters::new()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidParameters { kind, .. } if kind == "query"));
    }

    #[test]
    fn bad_optional_values_are_rejected() {
        let exec = QueryExecutor::new(None);
        assert!(exec.validate(&params(&[("query", "q"), ("top-k", "0")])).is_err());
        assert!(exec.validate(&params(&[("query", "q"), ("show-sources", "perhaps")])).is_err());
        assert!(exec.validate(&params(&[("query", "q"), ("mcp", "yes"), ("top-k", "3")])).is_ok());
    }

    #[tokio::test]
    async fn forwards_options_and_appends_sources() {
        let rag = Arc::new(FakeRag::default());
        let exec = QueryExecutor::new(Some(rag.clone()));
        let result = exec
            .run(
                CancellationToken::new(),
                &params(&[("query", "why?"), ("top-k", "4"), ("show-sources", "on")]),
            )
            .await;
        assert!(result.success);
        assert!(result.output.starts_with("answer to why?"));
        assert!(result.output.contains("- notes/a.md"));

        let seen = rag.seen.lock().unwrap();
        assert_eq!(seen[0].top_k, Some(4));
        assert!(seen[0].show_sources);
        assert!(!seen[0].use_tools);
    }

    #[tokio::test]
    async fn missing_service_fails_the_run() {
        let exec = QueryExecutor::new(None);
        let result = exec
            .run(CancellationToken::new(), &params(&[("query", "hi")]))
            .await;
        assert!(!result.success);
        assert_eq!(result.error, "RAG service not configured");
    }
}
