//! Executors shipped with the scheduler.

pub mod ingest;
pub mod params;
pub mod query;
pub mod script;
pub mod tool_call;

use std::sync::Arc;

use ragent_core::ScriptConfig;

pub use ingest::IngestExecutor;
pub use query::QueryExecutor;
pub use script::ScriptExecutor;
pub use tool_call::ToolCallExecutor;

use crate::collab::{ChatModel, RagService, ToolHost};
use crate::error::Result;
use crate::executor::ExecutorRegistry;

/// Collaborators handed to the built-in executors. Any may be absent; the
/// affected executors then fail their runs with a "not configured" message.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub rag: Option<Arc<dyn RagService>>,
    pub tools: Option<Arc<dyn ToolHost>>,
    pub model: Option<Arc<dyn ChatModel>>,
}

/// Register `query`, `ingest`, `tool-call` and `script` on `registry`.
pub fn register_defaults(
    registry: &ExecutorRegistry,
    collaborators: Collaborators,
    script: ScriptConfig,
) -> Result<()> {
    registry.register(Arc::new(QueryExecutor::new(collaborators.rag.clone())))?;
    registry.register(Arc::new(IngestExecutor::new(collaborators.rag)))?;
    registry.register(Arc::new(ToolCallExecutor::new(
        collaborators.tools,
        collaborators.model,
    )))?;
    registry.register(Arc::new(ScriptExecutor::new(script)))?;
    Ok(())
}
