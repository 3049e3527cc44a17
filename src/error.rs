// Service Error Types

use crate::execution::GraphError;
use crate::pipeline::ValidationError;
use thiserror::Error;

/// Errors surfaced by the pipeline service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("pipeline '{0}' not found")]
    NotFound(String),

    /// The submitted definition failed validation. Every problem found is
    /// reported, not just the first.
    #[error("pipeline definition is invalid ({} problem(s))", .0.len())]
    InvalidDefinition(Vec<ValidationError>),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Validation problems carried by this error, if any.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            ServiceError::InvalidDefinition(errors) => errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ServiceError::NotFound("deploy".to_string());
        assert_eq!(err.to_string(), "pipeline 'deploy' not found");
    }

    #[test]
    fn test_invalid_definition_reports_count() {
        let errors = vec![
            ValidationError::new("pipeline name must not be empty", "pipeline.name"),
            ValidationError::new("stage has no jobs", "stages[0].jobs"),
        ];
        let err = ServiceError::InvalidDefinition(errors);
        assert!(err.to_string().contains("2 problem(s)"));
        assert_eq!(err.validation_errors().len(), 2);
    }
}
