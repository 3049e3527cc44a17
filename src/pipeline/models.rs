use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle status shared by pipelines, stages, and jobs.
///
/// `Pending` is the initial state. `Success`, `Failure`, `Cancelled`, and
/// `Skipped` are terminal: once reached, a node never changes for that run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    /// Advance to `next`, keeping the state machine monotonic.
    /// Terminal states are never left.
    pub fn transition(self, next: Status) -> Status {
        if self.is_terminal() {
            self
        } else {
            next
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Trigger metadata carried on a pipeline. Opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Push,
    PullRequest,
    Manual,
    Schedule,
}

fn default_job_timeout() -> u64 {
    3600
}

/// A named unit of sequential shell commands with its own timeout, retry
/// budget, and failure policy. Only the scheduler mutates its status,
/// timestamps, and output fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Output path patterns, opaque to the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Names of sibling jobs that must settle before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Per-command timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub timeout: u64,
    /// Remaining retries, decremented by the scheduler as they are spent.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl Job {
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
            environment: HashMap::new(),
            artifacts: Vec::new(),
            dependencies: Vec::new(),
            timeout: default_job_timeout(),
            retry_count: 0,
            allow_failure: false,
            status: Status::Pending,
            start_time: None,
            end_time: None,
            output: String::new(),
            error: String::new(),
        }
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }
}

/// A named, dependency-ordered group of jobs within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub jobs: Vec<Job>,
    /// Names of sibling stages that must succeed before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Merged into each job's environment at run time.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub allow_failure: bool,
    /// Run jobs concurrently (by dependency level) rather than one at a time.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            name: name.into(),
            jobs,
            dependencies: Vec::new(),
            environment: HashMap::new(),
            allow_failure: false,
            parallel: false,
            status: Status::Pending,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Top-level container of stages plus global variables, triggers, and the
/// overall wall-clock budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
    /// Global variables, merged under stage/job environment.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    /// Overall wall-clock budget in seconds. `None` means unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<Duration>,
    /// Error text captured when execution fails outside any one job.
    #[serde(default)]
    pub error: Option<String>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            description: None,
            stages,
            variables: HashMap::new(),
            triggers: Vec::new(),
            timeout: None,
            status: Status::Pending,
            created_at: None,
            started_at: None,
            finished_at: None,
            duration: None,
            error: None,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Build the environment a job runs with.
///
/// Priority, lowest first: process environment (inherited by the spawned
/// command itself) < pipeline variables < stage environment < job
/// environment. The process environment is not collected here; the returned
/// map is layered on top of it by the command runner.
pub fn merged_environment(
    variables: &HashMap<String, String>,
    stage: &Stage,
    job: &Job,
) -> HashMap<String, String> {
    let mut env = variables.clone();
    env.extend(stage.environment.clone());
    env.extend(job.environment.clone());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Skipped.is_terminal());
    }

    #[test]
    fn test_status_transition_is_monotonic() {
        assert_eq!(Status::Pending.transition(Status::Running), Status::Running);
        assert_eq!(Status::Running.transition(Status::Failure), Status::Failure);
        // Terminal states are sticky
        assert_eq!(Status::Failure.transition(Status::Success), Status::Failure);
        assert_eq!(
            Status::Cancelled.transition(Status::Running),
            Status::Cancelled
        );
    }

    #[test]
    fn test_job_defaults_from_json() {
        let job: Job = serde_json::from_str(
            r#"{"name": "compile", "commands": ["echo ok"]}"#,
        )
        .unwrap();

        assert_eq!(job.timeout, 3600);
        assert_eq!(job.retry_count, 0);
        assert!(!job.allow_failure);
        assert_eq!(job.status, Status::Pending);
        assert!(job.start_time.is_none());
    }

    #[test]
    fn test_merged_environment_priority() {
        let mut variables = HashMap::new();
        variables.insert("A".to_string(), "pipeline".to_string());
        variables.insert("B".to_string(), "pipeline".to_string());
        variables.insert("C".to_string(), "pipeline".to_string());

        let mut stage_env = HashMap::new();
        stage_env.insert("B".to_string(), "stage".to_string());
        stage_env.insert("C".to_string(), "stage".to_string());

        let mut job_env = HashMap::new();
        job_env.insert("C".to_string(), "job".to_string());

        let job = Job::new("j", vec!["true".to_string()]).with_environment(job_env);
        let stage = Stage::new("s", vec![job.clone()]).with_environment(stage_env);

        let env = merged_environment(&variables, &stage, &job);
        assert_eq!(env.get("A").unwrap(), "pipeline");
        assert_eq!(env.get("B").unwrap(), "stage");
        assert_eq!(env.get("C").unwrap(), "job");
    }

    #[test]
    fn test_pipeline_round_trip() {
        let pipeline = Pipeline::new(
            "release",
            vec![Stage::new("build", vec![Job::new("compile", vec!["make".to_string()])])],
        );

        let json = serde_json::to_string(&pipeline).unwrap();
        let back: Pipeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "release");
        assert_eq!(back.stages[0].jobs[0].name, "compile");
    }
}
