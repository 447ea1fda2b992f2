//! Services the shipped executors delegate to.
//!
//! The scheduler does not know how retrieval, tools or language models are
//! implemented; hosts plug them in behind these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a collaborator service.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0} service not configured")]
    NotConfigured(&'static str),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagQuery {
    pub question: String,
    /// Number of chunks to retrieve; `None` leaves it to the service.
    pub top_k: Option<u32>,
    pub show_sources: bool,
    /// Let the service consult tools while answering.
    pub use_tools: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagAnswer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
}

#[async_trait]
pub trait RagService: Send + Sync {
    async fn query(&self, query: RagQuery) -> Result<RagAnswer, CollaboratorError>;
    async fn ingest(&self, path: &str, recursive: bool) -> Result<IngestReport, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool as advertised to the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool input.
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, CollaboratorError>;
    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system: String,
    /// Conversation so far, as role/content JSON messages.
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// `"tool_use"` when the model wants the tool calls executed.
    pub stop_reason: String,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, CollaboratorError>;
}
