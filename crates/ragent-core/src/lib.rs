//! `ragent-core`: configuration and error types shared by every ragent crate.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, ExecutorsConfig, RagentConfig, SchedulerConfig, ScriptConfig};
pub use error::{RagentError, Result};
