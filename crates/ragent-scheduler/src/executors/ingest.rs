//! `ingest` executor: asks the retrieval service to index a path.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::params::{bool_param, required};
use crate::collab::RagService;
use crate::error::Result;
use crate::executor::{ExecutionResult, Executor};
use crate::types::Parameters;

pub const KIND: &str = "ingest";

pub struct IngestExecutor {
    rag: Option<Arc<dyn RagService>>,
}

impl IngestExecutor {
    pub fn new(rag: Option<Arc<dyn RagService>>) -> Self {
        Self { rag }
    }
}

#[async_trait]
impl Executor for IngestExecutor {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, params: &Parameters) -> Result<()> {
        required(KIND, params, "path")?;
        bool_param(KIND, params, "recursive", true)?;
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult {
        let (path, recursive) = match required(KIND, params, "path")
            .and_then(|p| Ok((p, bool_param(KIND, params, "recursive", true)?)))
        {
            Ok(v) => v,
            Err(e) => return ExecutionResult::failure(e.to_string()),
        };
        let Some(rag) = self.rag.as_ref() else {
            return ExecutionResult::failure("RAG service not configured");
        };

        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecutionResult::cancelled(),
            report = rag.ingest(path, recursive) => report,
        };
        match report {
            Ok(r) => ExecutionResult::success(format!(
                "ingested {} documents ({} chunks) from {path}",
                r.documents, r.chunks
            )),
            Err(e) => ExecutionResult::failure(format!("ingest of {path} failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollaboratorError, IngestReport, RagAnswer, RagQuery};

    struct CountingRag;

    #[async_trait]
    impl RagService for CountingRag {
        async fn query(&self, _: RagQuery) -> std::result::Result<RagAnswer, CollaboratorError> {
            unreachable!()
        }

        async fn ingest(
            &self,
            path: &str,
            recursive: bool,
        ) -> std::result::Result<IngestReport, CollaboratorError> {
            if path == "/missing" {
                return Err(CollaboratorError::Failed("no such directory".into()));
            }
            Ok(IngestReport {
                documents: if recursive { 3 } else { 1 },
                chunks: 12,
            })
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn path_is_required() {
        let exec = IngestExecutor::new(None);
        assert!(exec.validate(&Parameters::new()).is_err());
        assert!(exec.validate(&params(&[("path", "/docs"), ("recursive", "nah")])).is_err());
        assert!(exec.validate(&params(&[("path", "/docs")])).is_ok());
    }

    #[tokio::test]
    async fn recursive_defaults_to_true() {
        let exec = IngestExecutor::new(Some(Arc::new(CountingRag)));
        let r = exec.run(CancellationToken::new(), &params(&[("path", "/docs")])).await;
        assert!(r.success);
        assert!(r.output.starts_with("ingested 3 documents"));

        let r = exec
            .run(CancellationToken::new(), &params(&[("path", "/docs"), ("recursive", "0")]))
            .await;
        assert!(r.output.starts_with("ingested 1 documents"));
    }

    #[tokio::test]
    async fn service_errors_become_failed_runs() {
        let exec = IngestExecutor::new(Some(Arc::new(CountingRag)));
        let r = exec.run(CancellationToken::new(), &params(&[("path", "/missing")])).await;
        assert!(!r.success);
        assert!(r.error.contains("no such directory"));
    }
}
