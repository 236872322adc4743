//! Step runners

pub mod shell;

use crate::error::Result;
use crate::models::{ExecutionResult, MAX_OUTPUT_SIZE};
use async_trait::async_trait;
use std::path::Path;

/// Executes a step's command reference.
///
/// A returned error means the command could not be run at all; a command that
/// ran and failed comes back as `Ok` with `success == false`. Workers treat
/// both as a failed step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, command: &str, working_dir: &Path) -> Result<ExecutionResult>;
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}
