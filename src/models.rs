//! Core data models for the mapflow orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Input validation limits
pub const MAX_DEFINITION_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_STEP_COUNT: usize = 1_000;
pub const MAX_STEP_NAME_LEN: usize = 64;
pub const MAX_COMMAND_LEN: usize = 4_096; // 4 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

/// Persistence-assigned map identifier
pub type MapId = i64;

/// Persistence-assigned step identifier
pub type StepId = i64;

/// Step lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepState {
    /// Completed and failed steps are never picked up again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow definition: a named, scheduled DAG of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Map {
    pub id: MapId,
    pub name: String,
    /// Cron expression, 5-field (minute precision) or 6-field (with seconds)
    pub schedule: String,
    pub is_active: bool,
    pub start_date: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
}

impl Map {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            schedule: schedule.into(),
            is_active: true,
            start_date: DateTime::<Utc>::default(),
            last_run: None,
            steps: Vec::new(),
        }
    }
}

/// Single unit of work within a map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub map_id: MapId,
    pub name: String,
    /// Command reference resolved against the worker's working directory
    pub command: String,
    pub state: StepState,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub dependencies: Vec<StepId>,
    /// Output or failure diagnostic of the last execution
    pub detail: Option<String>,
}

impl Step {
    /// New pending step with no dependencies
    pub fn new(name: impl Into<String>, map_id: MapId, command: impl Into<String>) -> Self {
        Self {
            id: 0,
            map_id,
            name: name.into(),
            command: command.into(),
            state: StepState::Pending,
            start_date: None,
            end_date: None,
            dependencies: Vec::new(),
            detail: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<StepId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Clear execution bookkeeping so the step can run again in a new map run
    pub fn reset(&mut self) {
        self.state = StepState::Pending;
        self.start_date = None;
        self.end_date = None;
        self.detail = None;
    }
}

/// Map definition as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDefinition {
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    pub steps: Vec<StepDefinition>,
}

fn default_active() -> bool {
    true
}

/// Step definition as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Result of a step runner invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// stdout followed by stderr
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration: Duration,
    #[serde(default)]
    pub output_truncated: bool, // True if output exceeded MAX_OUTPUT_SIZE
}

/// Signal emitted by a worker once a step reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub step_id: StepId,
    pub map_id: MapId,
    pub state: StepState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_state_display() {
        assert_eq!(StepState::Pending.to_string(), "pending");
        assert_eq!(StepState::Running.to_string(), "running");
        assert_eq!(StepState::Completed.to_string(), "completed");
        assert_eq!(StepState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(StepState::Completed.is_terminal());
        assert!(StepState::Failed.is_terminal());
    }

    #[test]
    fn test_new_step_is_pending() {
        let step = Step::new("extract", 7, "etl/extract.py").with_dependencies(vec![1, 2]);
        assert_eq!(step.state, StepState::Pending);
        assert_eq!(step.map_id, 7);
        assert_eq!(step.dependencies, vec![1, 2]);
        assert!(step.start_date.is_none());
    }

    #[test]
    fn test_reset_clears_bookkeeping() {
        let mut step = Step::new("load", 1, "load.py");
        step.state = StepState::Failed;
        step.start_date = Some(Utc::now());
        step.end_date = Some(Utc::now());
        step.detail = Some("exit status 1".to_string());

        step.reset();
        assert_eq!(step.state, StepState::Pending);
        assert!(step.start_date.is_none());
        assert!(step.end_date.is_none());
        assert!(step.detail.is_none());
    }

    #[test]
    fn test_map_definition_serde() {
        let yaml = r#"
name: nightly
schedule: "0 2 * * *"
steps:
  - name: extract
    command: etl/extract.py
  - name: load
    command: etl/load.py
    depends_on: [extract]
"#;
        let definition: MapDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(definition.name, "nightly");
        assert!(definition.active);
        assert!(definition.start_date.is_none());
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.steps[1].depends_on, vec!["extract".to_string()]);
    }

    #[test]
    fn test_step_state_serde() {
        let state: StepState = serde_yaml::from_str("completed").unwrap();
        assert_eq!(state, StepState::Completed);
    }
}
