//! Collaborators backed by an external command.
//!
//! `CommandRunner` spawns a process (an LLM CLI, a script) with the prompt as
//! its final argument and captures its output. `CommandProducer` and
//! `CommandProposer` build prompts for their capability and parse the
//! command's stdout into typed payloads.

use crate::collaborator::{
    ChangeProposer, FailureContext, ProductionOutput, Producer, Proposal, ResearchTask,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::patch::Change;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Which capability a command backs; decides the error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Proposer,
}

impl Role {
    fn error(self, message: impl Into<String>) -> Error {
        match self {
            Role::Producer => Error::production(message),
            Role::Proposer => Error::proposal(message),
        }
    }
}

/// Output captured from a command run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// All stdout output, joined with newlines.
    pub stdout: String,
    /// All stderr output, joined with newlines.
    pub stderr: String,
    /// Exit code of the process, if available.
    pub exit_code: Option<i32>,
    /// Duration of the run in seconds.
    pub duration_secs: f64,
}

impl CommandOutput {
    /// Check if the command exited successfully (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Get the last N lines of stderr.
    ///
    /// # Examples
    ///
    /// ```
    /// use autoscholar_core::CommandOutput;
    ///
    /// let output = CommandOutput {
    ///     stdout: String::new(),
    ///     stderr: "one\ntwo\nthree".to_string(),
    ///     exit_code: Some(1),
    ///     duration_secs: 0.5,
    /// };
    ///
    /// assert_eq!(output.stderr_tail(2), "two\nthree");
    /// ```
    pub fn stderr_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Spawns an external command with a prompt.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    args: Vec<String>,
    timeout_secs: u64,
}

impl CommandRunner {
    /// Create a runner for `command` with leading `args`.
    ///
    /// # Examples
    ///
    /// ```
    /// use autoscholar_core::CommandRunner;
    ///
    /// let runner = CommandRunner::new("claude", vec!["-p".to_string()], 300);
    /// assert_eq!(runner.command(), "claude");
    /// assert_eq!(runner.args(), &["-p".to_string()]);
    /// ```
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            args,
            timeout_secs,
        }
    }

    /// Get the command this runner will spawn.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get the arguments passed before the prompt.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    async fn run(&self, prompt: &str, role: Role) -> Result<CommandOutput> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(prompt);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                role.error(format!("command not found: {}", self.command))
            } else {
                role.error(format!("failed to spawn '{}': {e}", self.command))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| role.error("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| role.error("failed to capture stderr"))?;

        let collect = async {
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();
            let mut stdout_lines = Vec::new();
            let mut stderr_lines = Vec::new();
            let mut stderr_open = true;

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => match line {
                        Ok(Some(text)) => stdout_lines.push(text),
                        Ok(None) => {
                            while let Ok(Some(text)) = stderr_reader.next_line().await {
                                debug!(command = %self.command, stderr = %text);
                                stderr_lines.push(text);
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(command = %self.command, error = %e, "error reading stdout");
                            break;
                        }
                    },
                    line = stderr_reader.next_line(), if stderr_open => match line {
                        Ok(Some(text)) => {
                            debug!(command = %self.command, stderr = %text);
                            stderr_lines.push(text);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(command = %self.command, error = %e, "error reading stderr");
                            stderr_open = false;
                        }
                    },
                }
            }

            let status = child.wait().await;
            (stdout_lines, stderr_lines, status)
        };

        let (stdout_lines, stderr_lines, status) =
            match timeout(Duration::from_secs(self.timeout_secs), collect).await {
                Ok(collected) => collected,
                Err(_) => {
                    return Err(role.error(format!(
                        "timeout: '{}' did not finish within {} seconds",
                        self.command, self.timeout_secs
                    )))
                }
            };
        let status = status.map_err(|e| role.error(format!("wait failed: {e}")))?;

        let output = CommandOutput {
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
            exit_code: status.code(),
            duration_secs: start.elapsed().as_secs_f64(),
        };
        debug!(
            command = %self.command,
            exit_code = ?output.exit_code,
            duration_secs = output.duration_secs,
            "command finished"
        );
        Ok(output)
    }
}

/// Strip a surrounding markdown code fence, if any.
fn unfence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Produces research content by running a command.
///
/// Stdout is parsed as a JSON `ProductionOutput`; anything else non-empty is
/// taken verbatim as the summary.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    runner: CommandRunner,
}

impl CommandProducer {
    /// Create a producer for `command` with leading `args`.
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            runner: CommandRunner::new(command, args, timeout_secs),
        }
    }

    /// Build the producer from `config`, if a producer command is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.producer_command.as_ref().map(|command| {
            Self::new(
                command.clone(),
                config.producer_args.clone(),
                config.command_timeout_secs,
            )
        })
    }

    /// The prompt passed for `task`.
    pub fn prompt(task: &ResearchTask) -> String {
        format!(
            "Research the topic \"{}\". Respond with a JSON object with the fields \
             \"summary\" (string), \"sources\" (array of strings), \"tags\" (array of \
             short lowercase strings) and \"qualityHint\" (number between 0 and 1).",
            task.topic
        )
    }

    fn parse(&self, task: &ResearchTask, stdout: &str) -> Result<ProductionOutput> {
        let body = unfence(stdout);
        if body.is_empty() {
            return Err(Error::production(format!(
                "'{}' produced no output for '{}'",
                self.runner.command(),
                task.topic
            )));
        }
        if let Ok(output) = serde_json::from_str::<ProductionOutput>(body) {
            return Ok(output);
        }
        Ok(ProductionOutput {
            summary: body.to_string(),
            sources: vec![format!("command:{}", self.runner.command())],
            tags: vec![task.topic.to_lowercase()],
            quality_hint: None,
        })
    }
}

#[async_trait]
impl Producer for CommandProducer {
    async fn produce(&self, task: &ResearchTask) -> Result<ProductionOutput> {
        let output = self.runner.run(&Self::prompt(task), Role::Producer).await?;
        if !output.success() {
            return Err(Error::production(format!(
                "'{}' exited with {:?}: {}",
                self.runner.command(),
                output.exit_code,
                output.stderr_tail(5)
            )));
        }
        self.parse(task, &output.stdout)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProposalPayload {
    List(Vec<Change>),
    Wrapped { changes: Vec<Change> },
}

/// Proposes changes for a failure by running a command.
///
/// Stdout must be a JSON array of changes or an object with a `changes`
/// array; anything else comes back as `Proposal::Unparsable`.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    runner: CommandRunner,
}

impl CommandProposer {
    /// Create a proposer for `command` with leading `args`.
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            runner: CommandRunner::new(command, args, timeout_secs),
        }
    }

    /// Build the proposer from `config`, if a proposer command is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config.proposer_command.as_ref().map(|command| {
            Self::new(
                command.clone(),
                config.proposer_args.clone(),
                config.command_timeout_secs,
            )
        })
    }

    /// The prompt passed for `context`.
    pub fn prompt(context: &FailureContext) -> String {
        let details = if context.failure.details.is_empty() {
            String::new()
        } else {
            format!("\nDetails:\n{}", context.failure.details.join("\n"))
        };
        format!(
            "A {} failure occurred in {}: {}\nRoot cause: {}{}\n\n\
             Propose source changes as a JSON array of objects with the fields \
             \"targetFile\", \"changeDescription\", \"reason\" and \"kind\" \
             (error_handling, retry_logic, timeout, import_fix or other).",
            context.kind,
            context.failure.origin,
            context.failure.error,
            context.root_cause,
            details
        )
    }

    /// Parse the command's stdout.
    pub fn parse(stdout: &str) -> Proposal {
        match serde_json::from_str::<ProposalPayload>(unfence(stdout)) {
            Ok(ProposalPayload::List(changes)) | Ok(ProposalPayload::Wrapped { changes }) => {
                Proposal::Changes(changes)
            }
            Err(_) => Proposal::Unparsable(stdout.to_string()),
        }
    }
}

#[async_trait]
impl ChangeProposer for CommandProposer {
    async fn propose(&self, context: &FailureContext) -> Result<Proposal> {
        let output = self.runner.run(&Self::prompt(context), Role::Proposer).await?;
        if !output.success() {
            return Err(Error::proposal(format!(
                "'{}' exited with {:?}: {}",
                self.runner.command(),
                output.exit_code,
                output.stderr_tail(5)
            )));
        }
        Ok(Self::parse(&output.stdout))
    }
}
