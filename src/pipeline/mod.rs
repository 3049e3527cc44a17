pub mod models;
pub mod validate;

pub use models::{Job, Pipeline, Stage, Status, Trigger};
pub use validate::{PipelineValidator, ValidationError};
