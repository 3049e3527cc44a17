// Pipeline Engine Library
// Scheduling and execution engine for stage/job pipelines

pub mod error;
pub mod execution;
pub mod pipeline;
pub mod report;
pub mod runners;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export model types
pub use pipeline::{Job, Pipeline, PipelineValidator, Stage, Status, Trigger, ValidationError};

// Re-export execution types
pub use execution::{
    analyze, progress_channel, DependencyGraph, ExecutionEvent, ExecutorConfig, GraphError,
    PipelineExecutor, ProgressReceiver, ProgressSender, ScheduleReport,
};

// Re-export runner types
pub use runners::{CommandExecutor, CommandOutput, ShellRunner};

// Re-export report helpers
pub use report::{dependency_diagram, markdown_summary};

// Re-export service types
pub use services::{PipelineService, PipelineSummary};
