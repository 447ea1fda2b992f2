use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagentError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RagentError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            RagentError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RagentError>;
