// Pipeline Service
// Operational surface over the engine: a registry of named pipelines with
// create/run/cancel/inspect operations. Constructed and injected by the
// caller; there is no global instance.
//
// The registry keeps each pipeline's pristine definition separate from the
// state of its latest run, so a re-run always starts clean even though the
// scheduler mutates status, retry budgets, and output in place.

use crate::error::{ServiceError, ServiceResult};
use crate::execution::{analyze, ExecutorConfig, PipelineExecutor, ProgressSender, ScheduleReport};
use crate::pipeline::models::{Pipeline, Status};
use crate::pipeline::validate::{PipelineValidator, ValidationError};
use crate::runners::{CommandExecutor, ShellRunner};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Entry {
    /// The definition as created, never mutated by execution.
    definition: Pipeline,
    /// State of the latest run (or the definition itself before any run).
    current: Pipeline,
    /// Cancellation token for the in-flight run, if one is active.
    cancel: Option<CancellationToken>,
}

/// One row of `list_pipelines` output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub name: String,
    pub status: Status,
    pub total_stages: usize,
    pub created_at: Option<DateTime<Utc>>,
}

/// Registry and entry point for pipeline operations.
pub struct PipelineService {
    pipelines: Mutex<HashMap<String, Entry>>,
    config: ExecutorConfig,
    command_executor: Arc<dyn CommandExecutor>,
}

impl PipelineService {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            config: ExecutorConfig::default(),
            command_executor: Arc::new(ShellRunner::new()),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = executor;
        self
    }

    /// Validate a definition without registering it.
    pub fn validate_pipeline(pipeline: &Pipeline) -> Result<(), Vec<ValidationError>> {
        PipelineValidator::validate(pipeline)
    }

    /// Validate and register a pipeline. Re-creating an existing name
    /// replaces the entry, unless a run is in flight.
    pub fn create_pipeline(&self, mut pipeline: Pipeline) -> ServiceResult<()> {
        PipelineValidator::validate(&pipeline).map_err(ServiceError::InvalidDefinition)?;

        let mut pipelines = self.lock();
        if let Some(existing) = pipelines.get(&pipeline.name) {
            if existing.cancel.is_some() {
                return Err(ServiceError::InvalidInput(format!(
                    "pipeline '{}' is running; cancel it before replacing",
                    pipeline.name
                )));
            }
        }

        pipeline.created_at = Some(Utc::now());
        info!(pipeline = %pipeline.name, stages = pipeline.stages.len(), "pipeline created");

        pipelines.insert(
            pipeline.name.clone(),
            Entry {
                current: pipeline.clone(),
                definition: pipeline,
                cancel: None,
            },
        );
        Ok(())
    }

    /// Run a registered pipeline to completion and return its final state.
    pub async fn run_pipeline(&self, name: &str) -> ServiceResult<Pipeline> {
        self.run_inner(name, HashMap::new(), None).await
    }

    /// Like [`run_pipeline`](Self::run_pipeline), with the given variables
    /// layered over the definition's for this run only.
    pub async fn run_pipeline_with_overrides(
        &self,
        name: &str,
        overrides: HashMap<String, String>,
    ) -> ServiceResult<Pipeline> {
        self.run_inner(name, overrides, None).await
    }

    /// Like [`run_pipeline`](Self::run_pipeline), streaming progress events
    /// to the given sender.
    pub async fn run_pipeline_with_progress(
        &self,
        name: &str,
        progress: ProgressSender,
    ) -> ServiceResult<Pipeline> {
        self.run_inner(name, HashMap::new(), Some(progress)).await
    }

    async fn run_inner(
        &self,
        name: &str,
        overrides: HashMap<String, String>,
        progress: Option<ProgressSender>,
    ) -> ServiceResult<Pipeline> {
        // Take what the run needs under the lock, then release it; the lock
        // is never held across an await
        let (mut pipeline, cancel) = self.begin_run(name, overrides)?;

        let mut executor = PipelineExecutor::new()
            .with_config(self.config.clone())
            .with_command_executor(self.command_executor.clone())
            .with_cancellation(cancel);
        if let Some(tx) = progress {
            executor = executor.with_progress(tx);
        }

        executor.execute(&mut pipeline).await;

        self.finish_run(name, pipeline.clone());
        Ok(pipeline)
    }

    /// Run a registered pipeline from synchronous code. Safe to call from
    /// inside an existing runtime; see
    /// [`PipelineExecutor::execute_blocking`].
    pub fn run_pipeline_blocking(&self, name: &str) -> ServiceResult<Pipeline> {
        let (pipeline, cancel) = self.begin_run(name, HashMap::new())?;

        let executor = PipelineExecutor::new()
            .with_config(self.config.clone())
            .with_command_executor(self.command_executor.clone())
            .with_cancellation(cancel);

        let finished = executor.execute_blocking(pipeline);

        self.finish_run(name, finished.clone());
        Ok(finished)
    }

    /// Request cancellation of an in-flight run. Cooperative: running
    /// commands are killed, finished work keeps its status, and the run
    /// settles shortly after.
    pub fn cancel_pipeline(&self, name: &str) -> ServiceResult<()> {
        let mut pipelines = self.lock();
        let entry = pipelines
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        match entry.cancel.take() {
            Some(token) => {
                warn!(pipeline = %name, "cancellation requested");
                token.cancel();
                Ok(())
            }
            None => Err(ServiceError::InvalidInput(format!(
                "pipeline '{}' is not running",
                name
            ))),
        }
    }

    /// Latest known state of a pipeline, including per-stage and per-job
    /// status and output.
    pub fn pipeline_status(&self, name: &str) -> ServiceResult<Pipeline> {
        let pipelines = self.lock();
        pipelines
            .get(name)
            .map(|entry| entry.current.clone())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Summaries of every registered pipeline, sorted by name.
    pub fn list_pipelines(&self) -> Vec<PipelineSummary> {
        let pipelines = self.lock();
        let mut summaries: Vec<PipelineSummary> = pipelines
            .values()
            .map(|entry| PipelineSummary {
                name: entry.current.name.clone(),
                status: entry.current.status,
                total_stages: entry.current.stages.len(),
                created_at: entry.current.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Advisory schedule analysis of a registered pipeline's stage graph.
    pub fn analyze_pipeline(&self, name: &str) -> ServiceResult<ScheduleReport> {
        let pipelines = self.lock();
        let entry = pipelines
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        Ok(analyze(&entry.definition)?)
    }

    /// Remove a pipeline from the registry. An in-flight run must be
    /// cancelled first.
    pub fn remove_pipeline(&self, name: &str) -> ServiceResult<()> {
        let mut pipelines = self.lock();
        let entry = pipelines
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        if entry.cancel.is_some() {
            return Err(ServiceError::InvalidInput(format!(
                "pipeline '{}' is running; cancel it before removing",
                name
            )));
        }

        pipelines.remove(name);
        info!(pipeline = %name, "pipeline removed");
        Ok(())
    }

    /// Start a run: hand out a clean clone of the definition and register
    /// the cancellation token. Rejects concurrent runs of the same pipeline.
    fn begin_run(
        &self,
        name: &str,
        overrides: HashMap<String, String>,
    ) -> ServiceResult<(Pipeline, CancellationToken)> {
        let mut pipelines = self.lock();
        let entry = pipelines
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        if entry.cancel.is_some() {
            return Err(ServiceError::InvalidInput(format!(
                "pipeline '{}' is already running",
                name
            )));
        }

        let mut pipeline = entry.definition.clone();
        pipeline.variables.extend(overrides);
        let cancel = CancellationToken::new();
        entry.cancel = Some(cancel.clone());
        entry.current = pipeline.clone();
        entry.current.status = Status::Running;

        Ok((pipeline, cancel))
    }

    fn finish_run(&self, name: &str, finished: Pipeline) {
        let mut pipelines = self.lock();
        if let Some(entry) = pipelines.get_mut(name) {
            entry.current = finished;
            entry.cancel = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Recover from poisoning; the registry stays usable if a holder
        // panicked
        match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for PipelineService {
    fn default() -> Self {
        Self::new()
    }
}
