pub mod events;
pub mod executor;
pub mod graph;

pub use events::{
    progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender,
};
pub use executor::{ExecutorConfig, PipelineExecutor};
pub use graph::{analyze, DependencyGraph, GraphError, ScheduleReport};
