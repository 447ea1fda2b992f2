// Shared fixtures for the scheduler integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ragent_core::SchedulerConfig;
use ragent_scheduler::collab::{CollaboratorError, IngestReport, RagAnswer, RagQuery, RagService};
use ragent_scheduler::{
    Dispatcher, ExecutionResult, Executor, ExecutorRegistry, Parameters, Result, SchedulerHandle,
    Store,
};
use tokio_util::sync::CancellationToken;

/// Sleeps for `ms` milliseconds, tracking how many copies run at once and the
/// order in which `name`s started.
#[derive(Default)]
pub struct SleepExecutor {
    current: AtomicUsize,
    pub max_seen: AtomicUsize,
    pub started: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for SleepExecutor {
    fn kind(&self) -> &str {
        "sleep"
    }

    fn validate(&self, _: &Parameters) -> Result<()> {
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, params: &Parameters) -> ExecutionResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap()
            .push(params.get("name").cloned().unwrap_or_default());

        let ms = params.get("ms").and_then(|v| v.parse().ok()).unwrap_or(200);
        let result = tokio::select! {
            _ = cancel.cancelled() => ExecutionResult::cancelled(),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => ExecutionResult::success("slept"),
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct EchoRag;

#[async_trait]
impl RagService for EchoRag {
    async fn query(&self, query: RagQuery) -> std::result::Result<RagAnswer, CollaboratorError> {
        Ok(RagAnswer {
            answer: format!("echo: {}", query.question),
            sources: vec![],
        })
    }

    async fn ingest(
        &self,
        _path: &str,
        _recursive: bool,
    ) -> std::result::Result<IngestReport, CollaboratorError> {
        Ok(IngestReport::default())
    }
}

pub fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        tick_interval_ms: 50,
        drain_timeout_secs: 5,
        ..SchedulerConfig::default()
    }
}

pub fn handle_with(config: SchedulerConfig, executors: Vec<Arc<dyn Executor>>) -> SchedulerHandle {
    let registry = Arc::new(ExecutorRegistry::new());
    for executor in executors {
        registry.register(executor).unwrap();
    }
    let store = Store::open_in_memory().unwrap();
    SchedulerHandle::new(Arc::new(Dispatcher::new(store, registry, config)))
}

pub fn params(pairs: &[(&str, &str)]) -> Parameters {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Poll `check` every 20 ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
