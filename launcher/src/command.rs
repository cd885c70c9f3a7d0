//! Host command runner for vendor query tools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Why a host command could not produce output.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program is not installed on this host
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Output from one command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Runs a program with arguments and captures its output.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    working_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run `program args...`. A non-zero exit is reported in the output, not as an error.
    pub async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        debug!(program, ?args, "Executing command");
        let start = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let io_error = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound {
                    program: program.to_string(),
                }
            } else {
                CommandError::Io {
                    program: program.to_string(),
                    source,
                }
            }
        };

        let result = match self.timeout {
            Some(limit) => timeout(limit, run_command(cmd)).await.map_err(|_| {
                CommandError::Timeout {
                    program: program.to_string(),
                    secs: limit.as_secs(),
                }
            })?,
            None => run_command(cmd).await,
        };
        let (exit_code, stdout, stderr) = result.map_err(io_error)?;

        let output = CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
        };
        if output.is_success() {
            trace!(program, duration = ?output.duration, "Command succeeded");
        } else {
            warn!(program, exit_code, stderr = %output.stderr_trimmed(), "Command failed");
        }
        Ok(output)
    }
}

async fn run_command(mut cmd: Command) -> std::io::Result<(i32, String, String)> {
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));

    let status = child.wait().await?;
    Ok((status.code().unwrap_or(-1), stdout?, stderr?))
}

async fn read_all<R>(pipe: Option<R>) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(pipe);
    let mut output = String::new();
    let mut line = String::new();
    while reader.read_line(&mut line).await? > 0 {
        output.push_str(&line);
        line.clear();
    }
    Ok(output)
}
