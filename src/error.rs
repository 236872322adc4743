//! Error types for mapflow

use crate::models::StepId;
use thiserror::Error;

/// mapflow error types
#[derive(Error, Debug)]
pub enum MapflowError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Map definition size exceeded limit
    #[error("Map definition exceeds 1MB limit (size: {0} bytes)")]
    DefinitionSizeExceeded(usize),

    /// Step count exceeded limit
    #[error("Step count {count} exceeds limit of {limit}")]
    StepCountExceeded { count: usize, limit: usize },

    /// Step name validation error
    #[error("Step name '{name}' exceeds {max} characters")]
    StepNameTooLong { name: String, max: usize },

    /// Invalid step name format
    #[error("Invalid step name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidStepName { name: String },

    /// Generic definition validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dependency graph contains a cycle
    #[error("Cycle detected in map: {0}")]
    CycleDetected(String),

    /// Missing step dependency
    #[error("Step '{step}' depends on non-existent step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    /// Malformed cron expression
    #[error("Invalid cron expression '{expression}': {reason}")]
    ScheduleParse { expression: String, reason: String },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Step lookup miss
    #[error("Step {0} not found")]
    StepNotFound(StepId),

    /// Map lookup miss
    #[error("Map '{0}' not found")]
    MapNotFound(String),

    /// Store failures that are not database errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// JSON encoding of stored columns
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Step execution timeout
    #[error("Step command '{command}' timed out after {timeout} seconds")]
    StepTimeout { command: String, timeout: u64 },

    /// Command validation errors
    #[error("Command exceeds {limit} bytes")]
    CommandTooLong { limit: usize },

    /// Path validation errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path traversal attempt
    #[error("Path traversal detected in: {0}")]
    PathTraversal(String),

    /// The task queue no longer accepts steps
    #[error("Task queue is closed")]
    QueueClosed,

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl MapflowError {
    /// True for read/write failures against the store.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            MapflowError::Database(_)
                | MapflowError::StepNotFound(_)
                | MapflowError::MapNotFound(_)
                | MapflowError::Persistence(_)
                | MapflowError::Json(_)
        )
    }
}

/// Result type alias using MapflowError
pub type Result<T> = std::result::Result<T, MapflowError>;
