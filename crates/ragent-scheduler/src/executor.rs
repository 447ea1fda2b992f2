//! The executor capability and the kind → executor registry.
//!
//! An executor is the only extension point of the scheduler: it advertises a
//! kind tag, validates parameters cheaply, and performs the actual work.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::types::Parameters;

/// Outcome of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    /// Set when the run stopped because its cancellation token fired.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            cancelled: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            cancelled: false,
        }
    }

    /// Failure that still carries whatever output was produced.
    pub fn failure_with_output(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::failure(error)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::failure("cancelled")
        }
    }

    /// Convert into a plain `Result`, surfacing failures as
    /// [`SchedulerError::ExecutorFailure`] and cancellations as
    /// [`SchedulerError::Cancelled`].
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.output)
        } else if self.cancelled {
            Err(SchedulerError::Cancelled)
        } else {
            Err(SchedulerError::ExecutorFailure(self.error))
        }
    }
}

/// Trait every task kind implements.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Kind tag tasks use to select this executor (e.g. `"script"`).
    fn kind(&self) -> &str;

    /// Check parameters without side effects beyond cheap filesystem probes.
    fn validate(&self, params: &Parameters) -> Result<()>;

    /// Perform the work. Must return promptly once `cancel` fires.
    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult;
}

/// Shorthand for an [`SchedulerError::InvalidParameters`] from inside `validate`.
pub fn invalid_params(kind: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidParameters {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

/// Read-mostly map from kind to executor. Register everything before the
/// dispatcher starts; there is no deregistration.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, executor: Arc<dyn Executor>) -> Result<()> {
        let kind = executor.kind().to_string();
        let mut map = self
            .executors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.contains_key(&kind) {
            return Err(SchedulerError::DuplicateKind { kind });
        }
        info!(kind = %kind, "executor registered");
        map.insert(kind, executor);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(kind)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownKind {
                kind: kind.to_string(),
            })
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    /// Resolve `kind` and validate `params` against it.
    pub fn validate(&self, kind: &str, params: &Parameters) -> Result<()> {
        self.get(kind)?.validate(params)
    }
}
