// Pipeline Executor
// The runtime scheduling loop. Dispatch order comes from the same
// topological levels the analyzer reports, so declaration order of stages
// never matters: stages within a level run concurrently, levels run in
// order, and a stage whose dependencies did not succeed is skipped.
//
// Scheduling decisions happen on one logical task; command execution is
// offloaded to spawned tasks gated by a bounded worker pool. Status fields
// stay single-writer: tasks operate on cloned Stage/Job values and the
// scheduler writes the results back.

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::DependencyGraph;
use crate::pipeline::models::{merged_environment, Job, Pipeline, Stage, Status};
use crate::runners::{CommandExecutor, ShellRunner};
use crate::utils::substitute_variables;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of jobs running concurrently across the pipeline.
    pub max_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_workers: 10 }
    }
}

/// Pipeline executor
#[derive(Clone)]
pub struct PipelineExecutor {
    config: ExecutorConfig,
    command_executor: Arc<dyn CommandExecutor>,
    workers: Arc<Semaphore>,
    event_tx: Option<ProgressSender>,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    pub fn new() -> Self {
        let config = ExecutorConfig::default();
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            config,
            command_executor: Arc::new(ShellRunner::new()),
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        self.config = config;
        self
    }

    /// Replace the process-execution collaborator (tests inject fakes here).
    pub fn with_command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = executor;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this execution when fired. Cancellation is
    /// cooperative: no new work is dispatched, and in-flight commands are
    /// killed by the command executor.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the pipeline in place, mutating status, timestamps, and
    /// output as it goes. Execution failures land on the model, never as a
    /// returned error.
    pub async fn execute(&self, pipeline: &mut Pipeline) {
        let start = Instant::now();
        pipeline.status = pipeline.status.transition(Status::Running);
        pipeline.started_at = Some(Utc::now());

        info!(
            pipeline = %pipeline.name,
            stages = pipeline.stages.len(),
            max_workers = self.config.max_workers,
            "pipeline started"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            &pipeline.name,
            pipeline.stages.len(),
        ));

        let timeout = pipeline.timeout;
        let timed_out = match timeout {
            Some(secs) => {
                let budget = Duration::from_secs(secs);
                tokio::time::timeout(budget, self.run_stages(pipeline))
                    .await
                    .is_err()
            }
            None => {
                self.run_stages(pipeline).await;
                false
            }
        };

        if timed_out {
            self.cancel.cancel();
            let secs = timeout.unwrap_or(0);
            warn!(pipeline = %pipeline.name, timeout = secs, "pipeline timed out");
            pipeline.error = Some(format!("pipeline timed out after {}s", secs));
        }

        if timed_out || self.cancel.is_cancelled() {
            mark_unsettled_cancelled(pipeline);
        }

        let any_failed = pipeline.stages.iter().any(|s| s.status == Status::Failure);
        let final_status = if timed_out || any_failed {
            Status::Failure
        } else if self.cancel.is_cancelled() {
            Status::Cancelled
        } else {
            Status::Success
        };

        pipeline.status = pipeline.status.transition(final_status);
        pipeline.finished_at = Some(Utc::now());
        pipeline.duration = Some(start.elapsed());

        info!(
            pipeline = %pipeline.name,
            status = %pipeline.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &pipeline.name,
            pipeline.status,
            start.elapsed(),
        ));
    }

    /// Run the pipeline on a dedicated worker thread with a fresh runtime.
    ///
    /// Safe to call from any context, including from inside an existing
    /// Tokio runtime: the nested-event-loop hazard cannot occur because the
    /// scheduler loop never shares the caller's runtime.
    pub fn execute_blocking(self, pipeline: Pipeline) -> Pipeline {
        let name = pipeline.name.clone();

        let handle = std::thread::spawn(move || {
            let mut pipeline = pipeline;
            match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => {
                    runtime.block_on(self.execute(&mut pipeline));
                    pipeline
                }
                Err(e) => {
                    pipeline.status = pipeline.status.transition(Status::Failure);
                    pipeline.error = Some(format!("failed to start executor runtime: {}", e));
                    pipeline
                }
            }
        });

        match handle.join() {
            Ok(pipeline) => pipeline,
            Err(_) => {
                let mut pipeline = Pipeline::new(name, Vec::new());
                pipeline.status = Status::Failure;
                pipeline.error = Some("executor thread panicked".to_string());
                pipeline
            }
        }
    }

    async fn run_stages(&self, pipeline: &mut Pipeline) {
        let levels = match DependencyGraph::for_stages(pipeline)
            .and_then(|g| g.execution_levels())
        {
            Ok(levels) => levels,
            Err(e) => {
                // A validated pipeline cannot reach this; fail loudly if an
                // unvalidated one does
                warn!(pipeline = %pipeline.name, error = %e, "stage graph rejected");
                pipeline.error = Some(e.to_string());
                for stage in &mut pipeline.stages {
                    stage.status = stage.status.transition(Status::Skipped);
                    for job in &mut stage.jobs {
                        job.status = job.status.transition(Status::Skipped);
                    }
                }
                pipeline.status = pipeline.status.transition(Status::Failure);
                return;
            }
        };

        let variables = pipeline.variables.clone();

        for level in levels {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut ready = Vec::new();
            for name in &level {
                let Some(idx) = pipeline.stages.iter().position(|s| s.name == *name) else {
                    continue;
                };

                let unmet = pipeline.stages[idx]
                    .dependencies
                    .iter()
                    .find(|dep| {
                        pipeline
                            .stage(dep)
                            .map(|d| d.status != Status::Success)
                            .unwrap_or(true)
                    })
                    .cloned();

                match unmet {
                    Some(dep) => {
                        let stage = &mut pipeline.stages[idx];
                        let reason = format!("dependency '{}' did not succeed", dep);
                        info!(stage = %stage.name, %reason, "stage skipped");
                        self.event_tx.send_event(ExecutionEvent::StageSkipped {
                            stage_name: stage.name.clone(),
                            reason,
                        });
                        stage.status = stage.status.transition(Status::Skipped);
                        for job in &mut stage.jobs {
                            job.status = job.status.transition(Status::Skipped);
                        }
                    }
                    None => ready.push(idx),
                }
            }

            let mut handles = Vec::with_capacity(ready.len());
            for idx in ready {
                let stage = pipeline.stages[idx].clone();
                let executor = self.clone();
                let variables = variables.clone();
                handles.push((
                    idx,
                    tokio::spawn(async move { executor.execute_stage(stage, variables).await }),
                ));
            }

            for (idx, handle) in handles {
                match handle.await {
                    Ok(stage) => pipeline.stages[idx] = stage,
                    Err(e) => {
                        let stage = &mut pipeline.stages[idx];
                        warn!(stage = %stage.name, error = %e, "stage task panicked");
                        stage.status = stage.status.transition(Status::Failure);
                        stage.end_time = Some(Utc::now());
                        pipeline.error =
                            Some(format!("stage '{}' execution panicked: {}", stage.name, e));
                    }
                }
            }
        }
    }

    async fn execute_stage(
        &self,
        mut stage: Stage,
        variables: HashMap<String, String>,
    ) -> Stage {
        stage.status = stage.status.transition(Status::Running);
        stage.start_time = Some(Utc::now());

        info!(
            stage = %stage.name,
            jobs = stage.jobs.len(),
            parallel = stage.parallel,
            "stage started"
        );
        self.event_tx
            .send_event(ExecutionEvent::stage_started(&stage.name, stage.jobs.len()));

        let graph_ok = self.run_jobs(&mut stage, &variables).await;

        let failed = stage
            .jobs
            .iter()
            .any(|j| j.status == Status::Failure && !j.allow_failure);
        let cancelled = stage.jobs.iter().any(|j| j.status == Status::Cancelled);

        let status = if graph_ok.is_err() || (failed && !stage.allow_failure) {
            Status::Failure
        } else if cancelled && !failed {
            Status::Cancelled
        } else {
            Status::Success
        };

        stage.status = stage.status.transition(status);
        stage.end_time = Some(Utc::now());

        info!(stage = %stage.name, status = %stage.status, "stage finished");
        self.event_tx
            .send_event(ExecutionEvent::stage_completed(&stage.name, stage.status));

        stage
    }

    async fn run_jobs(
        &self,
        stage: &mut Stage,
        variables: &HashMap<String, String>,
    ) -> Result<(), String> {
        let levels = DependencyGraph::for_jobs(stage)
            .and_then(|g| g.execution_levels())
            .map_err(|e| {
                warn!(stage = %stage.name, error = %e, "job graph rejected");
                for job in &mut stage.jobs {
                    job.status = job.status.transition(Status::Skipped);
                }
                e.to_string()
            })?;

        if stage.parallel {
            self.run_jobs_parallel(stage, variables, levels).await;
        } else {
            let order: Vec<String> = levels.into_iter().flatten().collect();
            self.run_jobs_sequential(stage, variables, order).await;
        }

        Ok(())
    }

    /// Dispatch each dependency level concurrently, waiting for the whole
    /// level to settle before evaluating the next.
    async fn run_jobs_parallel(
        &self,
        stage: &mut Stage,
        variables: &HashMap<String, String>,
        levels: Vec<Vec<String>>,
    ) {
        for level in levels {
            let mut handles = Vec::new();

            for name in &level {
                let Some(idx) = stage.jobs.iter().position(|j| j.name == *name) else {
                    continue;
                };

                if self.cancel.is_cancelled() {
                    let job = &mut stage.jobs[idx];
                    job.status = job.status.transition(Status::Cancelled);
                    continue;
                }

                if let Some(dep) = self.unmet_job_dependency(stage, idx) {
                    self.skip_job(stage, idx, &dep);
                    continue;
                }

                let job = stage.jobs[idx].clone();
                let env = merged_environment(variables, stage, &job);
                let executor = self.clone();
                let stage_name = stage.name.clone();
                handles.push((
                    idx,
                    tokio::spawn(async move { executor.execute_job(job, env, stage_name).await }),
                ));
            }

            for (idx, handle) in handles {
                match handle.await {
                    Ok(job) => stage.jobs[idx] = job,
                    Err(e) => {
                        let job = &mut stage.jobs[idx];
                        warn!(job = %job.name, error = %e, "job task panicked");
                        job.status = job.status.transition(Status::Failure);
                        job.error.push_str(&format!("job execution panicked: {}", e));
                        job.end_time = Some(Utc::now());
                    }
                }
            }
        }
    }

    /// Dispatch jobs one at a time in topological order. A non-allowed
    /// failure stops dispatch; the rest are marked skipped.
    async fn run_jobs_sequential(
        &self,
        stage: &mut Stage,
        variables: &HashMap<String, String>,
        order: Vec<String>,
    ) {
        let mut halted = false;

        for name in &order {
            let Some(idx) = stage.jobs.iter().position(|j| j.name == *name) else {
                continue;
            };

            if self.cancel.is_cancelled() {
                let job = &mut stage.jobs[idx];
                job.status = job.status.transition(Status::Cancelled);
                continue;
            }

            if halted {
                self.skip_job(stage, idx, "an earlier job failed");
                continue;
            }

            if let Some(dep) = self.unmet_job_dependency(stage, idx) {
                self.skip_job(stage, idx, &dep);
                continue;
            }

            let job = stage.jobs[idx].clone();
            let env = merged_environment(variables, stage, &job);
            let finished = self.execute_job(job, env, stage.name.clone()).await;

            if finished.status == Status::Failure && !finished.allow_failure {
                halted = true;
            }
            stage.jobs[idx] = finished;
        }
    }

    /// First dependency of `stage.jobs[idx]` that has not been satisfied.
    /// A dependency is satisfied once it succeeded, or failed with
    /// `allow_failure` set.
    fn unmet_job_dependency(&self, stage: &Stage, idx: usize) -> Option<String> {
        stage.jobs[idx]
            .dependencies
            .iter()
            .find(|dep| {
                stage
                    .jobs
                    .iter()
                    .find(|j| j.name == **dep)
                    .map(|j| {
                        !(j.status == Status::Success
                            || (j.status == Status::Failure && j.allow_failure))
                    })
                    .unwrap_or(true)
            })
            .map(|dep| format!("dependency '{}' did not succeed", dep))
    }

    fn skip_job(&self, stage: &mut Stage, idx: usize, reason: &str) {
        let job = &mut stage.jobs[idx];
        debug!(stage = %stage.name, job = %job.name, reason, "job skipped");
        self.event_tx.send_event(ExecutionEvent::JobSkipped {
            stage_name: stage.name.clone(),
            job_name: job.name.clone(),
            reason: reason.to_string(),
        });
        job.status = job.status.transition(Status::Skipped);
    }

    /// Run one job: acquire a worker slot, then run its commands in order,
    /// re-executing a failed command while the retry budget lasts.
    async fn execute_job(
        &self,
        mut job: Job,
        env: HashMap<String, String>,
        stage_name: String,
    ) -> Job {
        let _permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                job.status = job.status.transition(Status::Failure);
                job.error.push_str("worker pool unavailable");
                return job;
            }
        };

        job.status = job.status.transition(Status::Running);
        job.start_time = Some(Utc::now());

        debug!(stage = %stage_name, job = %job.name, commands = job.commands.len(), "job started");
        self.event_tx.send_event(ExecutionEvent::JobStarted {
            stage_name: stage_name.clone(),
            job_name: job.name.clone(),
            total_commands: job.commands.len(),
        });

        let timeout = Duration::from_secs(job.timeout);
        let commands = job.commands.clone();

        'commands: for (index, raw) in commands.iter().enumerate() {
            if self.cancel.is_cancelled() {
                job.status = job.status.transition(Status::Cancelled);
                break;
            }

            let command = substitute_variables(raw, &env);

            loop {
                let output = self
                    .command_executor
                    .execute(&command, &env, timeout, &self.cancel)
                    .await;

                if !output.stdout.is_empty() {
                    append_line(&mut job.output, &output.stdout);
                    self.event_tx.send_event(ExecutionEvent::CommandOutput {
                        stage_name: stage_name.clone(),
                        job_name: job.name.clone(),
                        output: output.stdout.clone(),
                        is_error: false,
                    });
                }
                if !output.stderr.is_empty() {
                    append_line(&mut job.error, &output.stderr);
                    self.event_tx.send_event(ExecutionEvent::CommandOutput {
                        stage_name: stage_name.clone(),
                        job_name: job.name.clone(),
                        output: output.stderr.clone(),
                        is_error: true,
                    });
                }

                if output.success() {
                    break;
                }

                if self.cancel.is_cancelled() {
                    job.status = job.status.transition(Status::Cancelled);
                    break 'commands;
                }

                // Re-execute the same failed command while retries remain
                if job.retry_count > 0 {
                    job.retry_count -= 1;
                    warn!(
                        stage = %stage_name,
                        job = %job.name,
                        command = index,
                        retries_left = job.retry_count,
                        "command failed, retrying"
                    );
                    self.event_tx.send_event(ExecutionEvent::JobRetrying {
                        stage_name: stage_name.clone(),
                        job_name: job.name.clone(),
                        command_index: index,
                        retries_left: job.retry_count,
                    });
                    continue;
                }

                let code = output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                append_line(
                    &mut job.error,
                    &format!("command `{}` failed (exit code {})", command, code),
                );
                job.status = job.status.transition(Status::Failure);
                break 'commands;
            }
        }

        job.status = job.status.transition(Status::Success);
        job.end_time = Some(Utc::now());

        match job.status {
            Status::Failure => {
                warn!(stage = %stage_name, job = %job.name, "job failed")
            }
            status => debug!(stage = %stage_name, job = %job.name, %status, "job finished"),
        }
        self.event_tx.send_event(ExecutionEvent::job_completed(
            stage_name,
            &job.name,
            job.status,
        ));

        job
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(buffer: &mut String, text: &str) {
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(text);
}

/// After cancellation or timeout, settle everything still pending/running.
fn mark_unsettled_cancelled(pipeline: &mut Pipeline) {
    for stage in &mut pipeline.stages {
        for job in &mut stage.jobs {
            if !job.status.is_terminal() {
                job.status = job.status.transition(Status::Cancelled);
            }
        }
        if !stage.status.is_terminal() {
            stage.status = stage.status.transition(Status::Cancelled);
            stage.end_time = Some(Utc::now());
        }
    }
}
