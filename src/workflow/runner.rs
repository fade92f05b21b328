//! Workflow runner: one cancellable interval loop per running workflow.
//!
//! Every loop hangs off a single root `CancellationToken`. Iterations of
//! one workflow are serialized by a per-id execution lock, so a loop tick
//! and an out-of-band `run_once` never overlap. Different workflows run
//! concurrently.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::error::{ConfigError, WorkflowError};
use crate::llm::LanguageModel;
use crate::pipeline::factory::{DestinationFactory, SourceConfig, SourceFactory};
use crate::pipeline::processor::LlmProcessor;
use crate::pipeline::traits::Source;
use crate::store::WorkflowStore;
use crate::workflow::builder::WorkflowBuilder;
use crate::workflow::command::CommandInvoker;
use crate::workflow::model::{ProcessingMode, WorkflowDefinition, WorkflowExecutionResult};
use crate::workflow::state::WorkflowState;
use crate::workflow::workflow::Workflow;

/// Executes one iteration of a stored workflow.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(&self, workflow: &WorkflowDefinition) -> WorkflowExecutionResult;

    /// Release anything held for a deleted workflow.
    fn forget(&self, _workflow_id: &str) {}
}

struct CachedSource {
    config: SourceConfig,
    source: Arc<dyn Source>,
}

/// Builds a `Workflow` from a definition and runs it.
///
/// Sources are cached per workflow id because some of them keep cursor
/// state (the Telegram update offset) that must survive between ticks.
/// A changed source configuration replaces the cached source.
pub struct PipelineExecutor {
    sources: SourceFactory,
    destinations: Arc<DestinationFactory>,
    model: Arc<dyn LanguageModel>,
    config: RunnerConfig,
    history: Arc<CommandInvoker>,
    cached: Mutex<HashMap<String, CachedSource>>,
}

impl PipelineExecutor {
    pub fn new(
        sources: SourceFactory,
        destinations: Arc<DestinationFactory>,
        model: Arc<dyn LanguageModel>,
        config: RunnerConfig,
    ) -> Self {
        let history = Arc::new(CommandInvoker::new(config.history_cap));
        Self {
            sources,
            destinations,
            model,
            config,
            history,
            cached: Mutex::new(HashMap::new()),
        }
    }

    /// Processing commands of recent runs.
    pub fn history(&self) -> Arc<CommandInvoker> {
        Arc::clone(&self.history)
    }

    fn source_for(&self, workflow: &WorkflowDefinition) -> Result<Arc<dyn Source>, ConfigError> {
        let config = workflow.configuration.source();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cached.get(&workflow.id)
            && entry.config == config
        {
            return Ok(Arc::clone(&entry.source));
        }

        let source = self.sources.create_from_config(&config)?;
        debug!(workflow_id = %workflow.id, source = source.name(), "Source created");
        cached.insert(
            workflow.id.clone(),
            CachedSource {
                config,
                source: Arc::clone(&source),
            },
        );
        Ok(source)
    }

    fn build(&self, workflow: &WorkflowDefinition) -> Result<Workflow, WorkflowError> {
        workflow.validate()?;
        let source = self.source_for(workflow)?;
        let processor = LlmProcessor::new(Arc::clone(&self.model))
            .with_template(workflow.configuration.prompt_template())
            .with_timeout(self.config.llm_timeout);

        let built = WorkflowBuilder::new(Arc::clone(&self.destinations))
            .label(workflow.id.clone())
            .source(source)
            .processor(Arc::new(processor))
            .destination(workflow.configuration.destination())
            .formatter_strategy(workflow.configuration.formatter())
            .build()?;
        Ok(built.with_history(Arc::clone(&self.history)))
    }
}

#[async_trait]
impl WorkflowExecutor for PipelineExecutor {
    async fn execute(&self, workflow: &WorkflowDefinition) -> WorkflowExecutionResult {
        let built = match self.build(workflow) {
            Ok(built) => built,
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "Workflow could not be built");
                return WorkflowExecutionResult::failure("Workflow could not be built", e.to_string());
            }
        };
        match workflow.configuration.processing() {
            ProcessingMode::Single => built.execute_single().await,
            ProcessingMode::Batch { size } => built.execute_batch(size).await,
        }
    }

    fn forget(&self, workflow_id: &str) {
        self.cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workflow_id);
    }
}

struct LiveLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared with spawned loops.
struct Shared {
    executor: Arc<dyn WorkflowExecutor>,
    store: Arc<dyn WorkflowStore>,
    exec_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    states: RwLock<HashMap<String, WorkflowState>>,
}

impl Shared {
    fn exec_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.exec_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn state(&self, id: &str) -> WorkflowState {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or(WorkflowState::Stopped)
    }

    fn transition(&self, id: &str, target: WorkflowState) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        let current = states.get(id).copied().unwrap_or(WorkflowState::Stopped);
        if !current.can_transition_to(target) {
            warn!(workflow_id = %id, from = %current, to = %target, "Unexpected state transition");
        }
        states.insert(id.to_string(), target);
    }

    /// One guarded iteration: serialized per id, panics contained,
    /// `last_run_at` recorded whatever the outcome.
    async fn run_iteration(&self, workflow: &WorkflowDefinition) -> WorkflowExecutionResult {
        let lock = self.exec_lock(&workflow.id);
        let _guard = lock.lock().await;

        let result = match AssertUnwindSafe(self.executor.execute(workflow))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(workflow_id = %workflow.id, "Workflow iteration panicked");
                WorkflowExecutionResult::failure("Workflow iteration panicked", "panic")
            }
        };

        if let Err(e) = self.store.touch_last_run(&workflow.id, Utc::now()).await {
            warn!(workflow_id = %workflow.id, error = %e, "Failed to record last run");
        }

        if result.success {
            debug!(
                workflow_id = %workflow.id,
                processed = result.processed_count,
                summary = %result.message,
                "Workflow iteration finished"
            );
        } else {
            warn!(
                workflow_id = %workflow.id,
                summary = %result.message,
                error = ?result.error,
                "Workflow iteration failed"
            );
        }
        result
    }
}

async fn run_loop(shared: Arc<Shared>, workflow: WorkflowDefinition, token: CancellationToken) {
    let interval = workflow.effective_interval();
    info!(workflow_id = %workflow.id, interval_secs = interval.as_secs(), "Workflow loop started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = shared.run_iteration(&workflow) => {}
        }
        if token.is_cancelled() {
            break;
        }
        shared.transition(&workflow.id, WorkflowState::Running);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(workflow_id = %workflow.id, "Workflow loop exited");
}

/// Owns the per-workflow loops.
pub struct WorkflowRunner {
    shared: Arc<Shared>,
    root: CancellationToken,
    loops: AsyncMutex<HashMap<String, LiveLoop>>,
}

impl WorkflowRunner {
    pub fn new(executor: Arc<dyn WorkflowExecutor>, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor,
                store,
                exec_locks: Mutex::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
            }),
            root: CancellationToken::new(),
            loops: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the loop for `workflow`. An existing loop for
    /// the same id is cancelled and awaited first.
    pub async fn start_workflow(&self, workflow: WorkflowDefinition) -> Result<(), WorkflowError> {
        if self.root.is_cancelled() {
            return Err(WorkflowError::SupervisorStopped);
        }
        workflow.validate()?;

        let mut loops = self.loops.lock().await;
        if let Some(old) = loops.remove(&workflow.id) {
            self.halt(&workflow.id, old).await;
        }

        let id = workflow.id.clone();
        self.shared.transition(&id, WorkflowState::Starting);
        let token = self.root.child_token();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            workflow,
            token.clone(),
        ));
        loops.insert(id.clone(), LiveLoop { token, handle });
        self.shared.transition(&id, WorkflowState::Running);

        info!(workflow_id = %id, "Workflow started");
        Ok(())
    }

    /// Stop the loop for `id`. Returns whether a loop was stopped;
    /// stopping an idle workflow is a no-op.
    pub async fn stop_workflow(&self, id: &str) -> bool {
        let Some(live) = self.loops.lock().await.remove(id) else {
            debug!(workflow_id = %id, "Stop requested for idle workflow");
            return false;
        };
        self.halt(id, live).await;
        info!(workflow_id = %id, "Workflow stopped");
        true
    }

    /// Stop the loop for a deleted workflow and drop its per-id state.
    pub async fn remove(&self, id: &str) {
        self.stop_workflow(id).await;
        self.shared
            .exec_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.shared
            .states
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.shared.executor.forget(id);
    }

    /// Stop every loop. The runner stays usable.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, LiveLoop)> = self.loops.lock().await.drain().collect();
        let count = drained.len();
        for (id, live) in drained {
            self.halt(&id, live).await;
        }
        count
    }

    /// Cancel the root scope and wait for every loop. Later starts fail.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let stopped = self.stop_all().await;
        info!(stopped, "Workflow runner shut down");
    }

    /// Execute one iteration now, outside any loop.
    pub async fn run_once(&self, workflow: &WorkflowDefinition) -> WorkflowExecutionResult {
        self.shared.run_iteration(workflow).await
    }

    /// Whether a live loop exists for `id`. A loop that died on its own
    /// counts as not running.
    pub async fn is_running(&self, id: &str) -> bool {
        let live = self
            .loops
            .lock()
            .await
            .get(id)
            .is_some_and(|live| !live.handle.is_finished() && !live.token.is_cancelled());
        live && self.shared.state(id).is_active()
    }

    pub fn state(&self, id: &str) -> WorkflowState {
        self.shared.state(id)
    }

    /// Ids with a live loop.
    pub async fn running_ids(&self) -> Vec<String> {
        let loops = self.loops.lock().await;
        let mut ids: Vec<String> = loops
            .iter()
            .filter(|(_, live)| !live.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn halt(&self, id: &str, live: LiveLoop) {
        self.shared.transition(id, WorkflowState::Stopping);
        live.token.cancel();
        if let Err(e) = live.handle.await
            && !e.is_cancelled()
        {
            warn!(workflow_id = %id, error = %e, "Workflow loop ended abnormally");
        }
        self.shared.transition(id, WorkflowState::Stopped);
    }

    /// Abort a loop without going through stop, as a crash would.
    #[cfg(test)]
    pub(crate) async fn kill(&self, id: &str) {
        if let Some(live) = self.loops.lock().await.get(id) {
            live.handle.abort();
        }
    }
}
