// Execution Events
// Progress reporting for pipeline execution. Events are fire-and-forget so
// the engine never blocks on a slow or absent consumer.

use crate::pipeline::models::Status;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_name: String,
        total_stages: usize,
    },

    PipelineCompleted {
        pipeline_name: String,
        status: Status,
        duration: Duration,
    },

    StageStarted {
        stage_name: String,
        total_jobs: usize,
    },

    StageCompleted {
        stage_name: String,
        status: Status,
    },

    /// Stage was skipped because a dependency did not succeed
    StageSkipped { stage_name: String, reason: String },

    JobStarted {
        stage_name: String,
        job_name: String,
        total_commands: usize,
    },

    JobCompleted {
        stage_name: String,
        job_name: String,
        status: Status,
    },

    JobSkipped {
        stage_name: String,
        job_name: String,
        reason: String,
    },

    /// A failed command is being re-executed
    JobRetrying {
        stage_name: String,
        job_name: String,
        command_index: usize,
        retries_left: u32,
    },

    /// Output captured from a command (stdout or stderr)
    CommandOutput {
        stage_name: String,
        job_name: String,
        output: String,
        is_error: bool,
    },
}

impl ExecutionEvent {
    pub fn pipeline_started(name: impl Into<String>, total_stages: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_stages,
        }
    }

    pub fn pipeline_completed(
        name: impl Into<String>,
        status: Status,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            status,
            duration,
        }
    }

    pub fn stage_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            total_jobs,
        }
    }

    pub fn stage_completed(name: impl Into<String>, status: Status) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
        }
    }

    pub fn job_completed(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        status: Status,
    ) -> Self {
        Self::JobCompleted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            status,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::pipeline_started("test", 2));
        tx.send_event(ExecutionEvent::stage_started("build", 1));

        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::PipelineStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::StageStarted { .. }
        ));
    }

    #[test]
    fn test_optional_sender_does_not_panic() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::stage_completed("build", Status::Success));
    }
}
