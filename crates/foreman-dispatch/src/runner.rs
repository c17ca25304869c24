use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use foreman_core::CoreError;
use tokio::process::{Child, Command};

pub const TASK_FILE: &str = "task.md";
pub const SYSTEM_PROMPT_FILE: &str = "system-prompt.txt";
pub const OUTPUT_FILE: &str = "output.md";
pub const STDERR_FILE: &str = "stderr.log";
pub const SESSION_EVENT_LOG: &str = "session.jsonl";

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// One bounded invocation of the external agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub binary: PathBuf,
    pub model: String,
    pub task: String,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
    pub session_dir: PathBuf,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentProcessResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, invocation: &AgentInvocation) -> AgentProcessResult;
}

#[derive(Debug, Clone)]
pub struct AgentProcessRunner {
    terminate_grace: Duration,
}

impl Default for AgentProcessRunner {
    fn default() -> Self {
        Self {
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl AgentProcessRunner {
    pub fn with_terminate_grace(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }

    async fn try_run(&self, invocation: &AgentInvocation) -> Result<AgentProcessResult, CoreError> {
        tokio::fs::create_dir_all(&invocation.session_dir)
            .await
            .map_err(|error| {
                CoreError::Workspace(format!(
                    "Failed to create session directory '{}': {error}",
                    invocation.session_dir.display()
                ))
            })?;

        let task_path = invocation.session_dir.join(TASK_FILE);
        let prompt_path = invocation.session_dir.join(SYSTEM_PROMPT_FILE);
        let output_path = invocation.session_dir.join(OUTPUT_FILE);
        let stderr_path = invocation.session_dir.join(STDERR_FILE);

        tokio::fs::write(&task_path, &invocation.task)
            .await
            .map_err(|error| {
                CoreError::Workspace(format!(
                    "Failed to write '{}': {error}",
                    task_path.display()
                ))
            })?;
        tokio::fs::write(&prompt_path, &invocation.system_prompt)
            .await
            .map_err(|error| {
                CoreError::Workspace(format!(
                    "Failed to write '{}': {error}",
                    prompt_path.display()
                ))
            })?;

        // The agent may run for minutes and emit arbitrarily much; its
        // streams land in files, never in memory.
        let output_file = std::fs::File::create(&output_path).map_err(|error| {
            CoreError::Workspace(format!(
                "Failed to create '{}': {error}",
                output_path.display()
            ))
        })?;
        let stderr_file = std::fs::File::create(&stderr_path).map_err(|error| {
            CoreError::Workspace(format!(
                "Failed to create '{}': {error}",
                stderr_path.display()
            ))
        })?;

        let mut child = Command::new(&invocation.binary)
            .arg("--task-file")
            .arg(&task_path)
            .arg("--system-prompt-file")
            .arg(&prompt_path)
            .arg("--model")
            .arg(&invocation.model)
            .arg("--allowed-tools")
            .arg(invocation.allowed_tools.join(","))
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "Failed to spawn agent binary `{}`: {error}",
                    invocation.binary.display()
                ))
            })?;

        let (exit_code, timed_out) =
            match tokio::time::timeout(invocation.timeout, child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(|error| {
                        CoreError::DependencyUnavailable(format!(
                            "Failed to await agent process: {error}"
                        ))
                    })?;
                    (status.code(), false)
                }
                Err(_) => {
                    self.terminate(&mut child).await;
                    (None, true)
                }
            };

        let stdout = tokio::fs::read_to_string(&output_path)
            .await
            .unwrap_or_default();
        let stderr = tokio::fs::read_to_string(&stderr_path)
            .await
            .unwrap_or_default();

        append_session_event(&invocation.session_dir, timed_out, exit_code, stdout.len());

        Ok(AgentProcessResult {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }

    /// SIGTERM first so the agent can flush; SIGKILL after the grace window
    /// if it is still alive.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(self.terminate_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl AgentRunner for AgentProcessRunner {
    /// Never errors to the caller: failures surface as a result whose
    /// stderr carries the diagnostic, and the caller interprets everything.
    async fn run(&self, invocation: &AgentInvocation) -> AgentProcessResult {
        match self.try_run(invocation).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(
                    binary = %invocation.binary.display(),
                    error = %error,
                    "agent process invocation failed before completion"
                );
                AgentProcessResult {
                    stderr: error.to_string(),
                    ..AgentProcessResult::default()
                }
            }
        }
    }
}

fn append_session_event(
    session_dir: &std::path::Path,
    timed_out: bool,
    exit_code: Option<i32>,
    stdout_len: usize,
) {
    let event = serde_json::json!({
        "event": if timed_out { "timeout" } else { "completed" },
        "exit_code": exit_code,
        "stdout_len": stdout_len,
        "at": Utc::now().to_rfc3339(),
    });
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(session_dir.join(SESSION_EVENT_LOG))
        .and_then(|mut file| {
            use std::io::Write;
            writeln!(file, "{event}")
        });
    if let Err(error) = result {
        tracing::warn!(error = %error, "failed to append session event log entry");
    }
}
