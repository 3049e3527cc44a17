// Shell Runner
// The process-execution boundary. The scheduler never spawns processes
// itself; it hands commands to a CommandExecutor, which owns spawning and
// kill semantics (timeout and cancellation included).

use crate::utils::resolve_working_dir;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Synthetic exit code reported for a timed-out command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of running a single command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code if the process ran to completion (or a synthetic code for
    /// timeouts). `None` when the process could not be spawned or was killed
    /// by cancellation.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn spawn_failure(message: String) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Boundary for process execution. Implementations own process lifecycle,
/// including hard kill on timeout or cancellation; the scheduler only stops
/// dispatching new work.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandOutput;
}

/// Default executor: runs commands through the system shell.
pub struct ShellRunner {
    working_dir: PathBuf,
}

impl ShellRunner {
    /// Runner rooted at the enclosing git repository, or the current
    /// directory when there is none.
    pub fn new() -> Self {
        Self {
            working_dir: resolve_working_dir(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    fn shell_command() -> (&'static str, &'static str) {
        if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellRunner {
    async fn execute(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CommandOutput {
        let (shell, shell_arg) = Self::shell_command();

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg);
        cmd.arg(command);
        cmd.current_dir(&self.working_dir);
        // The child inherits the process environment; the merged map layers
        // on top of it
        cmd.envs(env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput::spawn_failure(format!(
                    "failed to spawn shell process '{}': {}",
                    shell, e
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&line);
                }
            }
            output
        });

        let stderr_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&line);
                }
            }
            output
        });

        let exit_code = tokio::select! {
            wait_result = tokio::time::timeout(timeout, child.wait()) => {
                match wait_result {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(e)) => {
                        return CommandOutput::spawn_failure(format!(
                            "failed to wait for shell process: {}",
                            e
                        ));
                    }
                    Err(_) => {
                        // Timeout: kill and report the synthetic exit code
                        let _ = child.kill().await;
                        return CommandOutput {
                            exit_code: Some(TIMEOUT_EXIT_CODE),
                            stdout: stdout_handle.await.unwrap_or_default(),
                            stderr: format!("command timed out after {:?}", timeout),
                        };
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return CommandOutput {
                    exit_code: None,
                    stdout: stdout_handle.await.unwrap_or_default(),
                    stderr: "command cancelled".to_string(),
                };
            }
        };

        CommandOutput {
            exit_code,
            stdout: stdout_handle.await.unwrap_or_default(),
            stderr: stderr_handle.await.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_echo() {
        let runner = ShellRunner::new();
        let output = runner
            .execute("echo hello", &HashMap::new(), Duration::from_secs(5), &token())
            .await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exit_code() {
        let runner = ShellRunner::new();
        let output = runner
            .execute("exit 42", &HashMap::new(), Duration::from_secs(5), &token())
            .await;

        assert_eq!(output.exit_code, Some(42));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_env_is_layered_over_process_env() {
        let runner = ShellRunner::new();
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "from_engine".to_string());

        let output = runner
            .execute("echo $MY_VAR:$HOME", &env, Duration::from_secs(5), &token())
            .await;

        assert!(output.stdout.starts_with("from_engine:"));
        // Process environment still visible underneath
        assert!(output.stdout.len() > "from_engine:".len());
    }

    #[tokio::test]
    async fn test_runs_in_configured_working_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();

        let runner = ShellRunner::new().with_working_dir(temp.path());
        let output = runner
            .execute("ls", &HashMap::new(), Duration::from_secs(5), &token())
            .await;

        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let runner = ShellRunner::new();
        let output = runner
            .execute("echo oops >&2", &HashMap::new(), Duration::from_secs(5), &token())
            .await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_synthetic_code() {
        let runner = ShellRunner::new();
        let output = runner
            .execute("sleep 5", &HashMap::new(), Duration::from_millis(200), &token())
            .await;

        assert_eq!(output.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let runner = ShellRunner::new();
        let cancel = token();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let output = runner
            .execute("sleep 5", &HashMap::new(), Duration::from_secs(10), &cancel)
            .await;

        assert_eq!(output.exit_code, None);
        assert!(output.stderr.contains("cancelled"));
    }
}
