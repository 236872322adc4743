//! Local process runner

use crate::error::{MapflowError, Result};
use crate::models::{ExecutionResult, MAX_OUTPUT_SIZE};
use crate::parser::validate_command;
use crate::runners::{truncate_output_bytes, StepRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Runs a step command as a local process.
///
/// The first token of the command reference is the program; relative
/// programs are resolved against the working directory, which is also the
/// process's current directory. The remaining tokens are passed as arguments
/// without shell interpolation. With an interpreter configured (for example
/// `python3`), the resolved program path is handed to the interpreter instead
/// of being executed directly.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    interpreter: Option<String>,
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Kill the process if it runs longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_command(&self, command: &str, working_dir: &Path) -> Result<Command> {
        validate_command(command)?;

        if !working_dir.is_dir() {
            return Err(MapflowError::InvalidPath(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }

        let mut tokens = command.split_whitespace();
        let program = tokens
            .next()
            .ok_or_else(|| MapflowError::InvalidPath("empty command".to_string()))?;
        let program = resolve_program(program, working_dir);

        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&program);
                cmd
            }
            None => Command::new(&program),
        };
        cmd.args(tokens);
        cmd.current_dir(working_dir);

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // Timed-out children must not outlive the dropped future
        cmd.kill_on_drop(true);

        Ok(cmd)
    }
}

/// Absolute paths are kept; a bare name that is not a file in the working
/// directory is left for PATH lookup.
fn resolve_program(program: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let local = working_dir.join(path);
    if program.contains('/') || local.is_file() {
        local
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn run(&self, command: &str, working_dir: &Path) -> Result<ExecutionResult> {
        let mut cmd = self.build_command(command, working_dir)?;

        info!("Running step command: {}", command);
        debug!("Working directory: {}", working_dir.display());

        let start = std::time::Instant::now();

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    error!("Command timed out after {} seconds", timeout.as_secs());
                    return Err(MapflowError::StepTimeout {
                        command: command.to_string(),
                        timeout: timeout.as_secs(),
                    });
                }
            },
            None => cmd.output().await,
        }
        .map_err(|e| {
            error!("Command execution failed: {}", e);
            MapflowError::Io(e)
        })?;

        let duration = start.elapsed();

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let (output_text, output_truncated) = truncate_output_bytes(&combined);

        if output_truncated {
            debug!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        info!(
            "Command finished (success: {}, exit code: {:?})",
            output.status.success(),
            output.status.code()
        );

        Ok(ExecutionResult {
            success: output.status.success(),
            output: output_text,
            exit_code: output.status.code(),
            duration,
            output_truncated,
        })
    }
}
