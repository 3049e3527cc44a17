// Pipeline Validator
// Structural and dependency checks run before execution. All checks are pure
// functions of the declared configuration; they never execute commands, and
// problems come back as a list so a caller can display everything at once.

use crate::pipeline::models::{Job, Pipeline, Stage};

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Validation error for semantic checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error at '{}': {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Validator for pipeline definitions
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition for structural and semantic correctness.
    ///
    /// Checks are deterministic: identical input yields an identical error
    /// list, in declaration order.
    pub fn validate(pipeline: &Pipeline) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if pipeline.name.trim().is_empty() {
            errors.push(ValidationError::new("pipeline name must not be empty", "pipeline.name"));
        }

        if pipeline.stages.is_empty() {
            errors.push(
                ValidationError::new("pipeline must have at least one stage", "pipeline.stages")
                    .with_suggestion("add a 'stages' list to the definition"),
            );
        }

        if let Some(timeout) = pipeline.timeout {
            if timeout == 0 {
                errors.push(ValidationError::new(
                    "pipeline timeout must be greater than zero",
                    "pipeline.timeout",
                ));
            }
        }

        let mut seen_stages = HashSet::new();
        for (i, stage) in pipeline.stages.iter().enumerate() {
            let path = format!("stages[{}]", i);

            if stage.name.trim().is_empty() {
                errors.push(ValidationError::new("stage name must not be empty", format!("{}.name", path)));
            } else if !seen_stages.insert(stage.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("duplicate stage name '{}'", stage.name),
                    format!("{}.name", path),
                ));
            }

            Self::validate_stage(stage, &path, &mut errors);
        }

        Self::validate_stage_dependencies(&pipeline.stages, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_stage(stage: &Stage, path: &str, errors: &mut Vec<ValidationError>) {
        if stage.jobs.is_empty() {
            errors.push(
                ValidationError::new(
                    format!("stage '{}' must have at least one job", stage.name),
                    format!("{}.jobs", path),
                )
                .with_suggestion("add a 'jobs' list to the stage"),
            );
        }

        let mut seen_jobs = HashSet::new();
        for (i, job) in stage.jobs.iter().enumerate() {
            let job_path = format!("{}.jobs[{}]", path, i);

            if job.name.trim().is_empty() {
                errors.push(ValidationError::new("job name must not be empty", format!("{}.name", job_path)));
            } else if !seen_jobs.insert(job.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("duplicate job name '{}' in stage '{}'", job.name, stage.name),
                    format!("{}.name", job_path),
                ));
            }

            Self::validate_job(job, &job_path, errors);
        }

        Self::validate_job_dependencies(stage, errors);
    }

    fn validate_job(job: &Job, path: &str, errors: &mut Vec<ValidationError>) {
        if job.commands.is_empty() {
            errors.push(
                ValidationError::new(
                    format!("job '{}' must have a non-empty command list", job.name),
                    format!("{}.commands", path),
                )
                .with_suggestion("add 'commands' to define what the job should do"),
            );
        }

        if job.commands.iter().any(|c| c.trim().is_empty()) {
            errors.push(ValidationError::new(
                format!("job '{}' contains an empty command", job.name),
                format!("{}.commands", path),
            ));
        }

        if job.timeout == 0 {
            errors.push(ValidationError::new(
                format!("job '{}' timeout must be greater than zero", job.name),
                format!("{}.timeout", path),
            ));
        }
    }

    /// Check that every stage dependency references an existing sibling, that
    /// no stage depends on itself, and that the stage graph is acyclic.
    ///
    /// Cycle detection reports the first cycle found and stops; it does not
    /// enumerate all cycles.
    pub fn validate_stage_dependencies(stages: &[Stage], errors: &mut Vec<ValidationError>) {
        let stage_names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();

        for stage in stages {
            for dep in &stage.dependencies {
                if dep == &stage.name {
                    errors.push(ValidationError::new(
                        format!("stage '{}' depends on itself", stage.name),
                        format!("stages.{}.dependencies", stage.name),
                    ));
                } else if !stage_names.contains(&dep.as_str()) {
                    errors.push(
                        ValidationError::new(
                            format!("stage '{}' depends on unknown stage '{}'", stage.name, dep),
                            format!("stages.{}.dependencies", stage.name),
                        )
                        .with_suggestion(format!("available stages: {}", stage_names.join(", "))),
                    );
                }
            }
        }

        // Self-dependencies are reported above; keep them out of the DFS
        if let Err(cycle) = detect_cycles(&stage_names, |name| {
            stages
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.dependencies.iter().filter(|d| *d != name).cloned().collect())
                .unwrap_or_default()
        }) {
            errors.push(ValidationError::new(
                format!("circular dependency detected: {}", cycle.join(" -> ")),
                "stages",
            ));
        }
    }

    fn validate_job_dependencies(stage: &Stage, errors: &mut Vec<ValidationError>) {
        let job_names: Vec<&str> = stage.jobs.iter().map(|j| j.name.as_str()).collect();

        for job in &stage.jobs {
            for dep in &job.dependencies {
                if dep == &job.name {
                    errors.push(ValidationError::new(
                        format!("job '{}' depends on itself", job.name),
                        format!("stages.{}.jobs.{}.dependencies", stage.name, job.name),
                    ));
                } else if !job_names.contains(&dep.as_str()) {
                    errors.push(
                        ValidationError::new(
                            format!("job '{}' depends on unknown job '{}'", job.name, dep),
                            format!("stages.{}.jobs.{}.dependencies", stage.name, job.name),
                        )
                        .with_suggestion(format!("available jobs: {}", job_names.join(", "))),
                    );
                }
            }
        }

        if let Err(cycle) = detect_cycles(&job_names, |name| {
            stage
                .jobs
                .iter()
                .find(|j| j.name == name)
                .map(|j| j.dependencies.iter().filter(|d| *d != name).cloned().collect())
                .unwrap_or_default()
        }) {
            errors.push(ValidationError::new(
                format!(
                    "circular dependency detected in jobs of stage '{}': {}",
                    stage.name,
                    cycle.join(" -> ")
                ),
                format!("stages.{}.jobs", stage.name),
            ));
        }
    }
}

/// Detect cycles in a dependency graph using DFS with color marking.
/// Returns the path of the first cycle found.
fn detect_cycles<F>(nodes: &[&str], get_deps: F) -> Result<(), Vec<String>>
where
    F: Fn(&str) -> Vec<String>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum NodeState {
        Unvisited,
        Visiting,
        Visited,
    }

    fn visit<F>(
        node: &str,
        states: &mut HashMap<String, NodeState>,
        path: &mut Vec<String>,
        get_deps: &F,
    ) -> Result<(), Vec<String>>
    where
        F: Fn(&str) -> Vec<String>,
    {
        match states.get(node) {
            Some(NodeState::Visiting) => {
                // Found a cycle; slice the current path from its first visit
                let start = path.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(node.to_string());
                return Err(cycle);
            }
            Some(NodeState::Visited) => return Ok(()),
            _ => {}
        }

        states.insert(node.to_string(), NodeState::Visiting);
        path.push(node.to_string());

        for dep in get_deps(node) {
            // Unknown names are reported separately; skip them here
            if states.contains_key(dep.as_str()) {
                visit(&dep, states, path, get_deps)?;
            }
        }

        path.pop();
        states.insert(node.to_string(), NodeState::Visited);
        Ok(())
    }

    let mut states: HashMap<String, NodeState> = nodes
        .iter()
        .map(|n| (n.to_string(), NodeState::Unvisited))
        .collect();
    let mut path = Vec::new();

    for node in nodes {
        if states.get(*node) == Some(&NodeState::Unvisited) {
            visit(node, &mut states, &mut path, &get_deps)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{Job, Pipeline, Stage};

    fn job(name: &str) -> Job {
        Job::new(name, vec!["echo ok".to_string()])
    }

    fn stage(name: &str, deps: &[&str]) -> Stage {
        Stage::new(name, vec![job("work")])
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = Pipeline::new("p", vec![stage("build", &[]), stage("test", &["build"])]);
        assert!(PipelineValidator::validate(&pipeline).is_ok());
    }

    #[test]
    fn test_empty_commands_rejected() {
        let mut s = stage("build", &[]);
        s.jobs = vec![Job::new("compile", vec![])];
        let pipeline = Pipeline::new("p", vec![s]);

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("non-empty command list")));
    }

    #[test]
    fn test_missing_dependency_names_both_sides() {
        let pipeline = Pipeline::new("p", vec![stage("test", &["build"])]);

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        let msg = &errors[0].message;
        assert!(msg.contains("test"), "should name the dependent: {}", msg);
        assert!(msg.contains("build"), "should name the missing target: {}", msg);
    }

    #[test]
    fn test_self_dependency() {
        let pipeline = Pipeline::new("p", vec![stage("build", &["build"])]);

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("depends on itself")));
    }

    #[test]
    fn test_cycle_reports_member_and_stops() {
        let pipeline = Pipeline::new(
            "p",
            vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"])],
        );

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        let cycles: Vec<_> = errors
            .iter()
            .filter(|e| e.message.contains("circular dependency"))
            .collect();
        // First cycle only
        assert_eq!(cycles.len(), 1);
        assert!(["a", "b", "c"].iter().any(|n| cycles[0].message.contains(n)));
    }

    #[test]
    fn test_duplicate_names() {
        let pipeline = Pipeline::new("p", vec![stage("build", &[]), stage("build", &[])]);
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate stage name")));

        let mut s = stage("build", &[]);
        s.jobs = vec![job("compile"), job("compile")];
        let pipeline = Pipeline::new("p", vec![s]);
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate job name")));
    }

    #[test]
    fn test_job_cycle_detected() {
        let mut s = stage("build", &[]);
        s.jobs = vec![
            job("a").with_dependencies(vec!["b".to_string()]),
            job("b").with_dependencies(vec!["a".to_string()]),
        ];
        let pipeline = Pipeline::new("p", vec![s]);

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("jobs of stage 'build'")));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let pipeline = Pipeline::new(
            "p",
            vec![stage("a", &["missing"]), stage("b", &["b"])],
        );

        let first = PipelineValidator::validate(&pipeline).unwrap_err();
        let second = PipelineValidator::validate(&pipeline).unwrap_err();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut s = stage("build", &[]);
        s.jobs = vec![job("compile").with_timeout(0)];
        let pipeline = Pipeline::new("p", vec![s]);

        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("timeout")));
    }
}
