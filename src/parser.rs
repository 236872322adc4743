//! YAML parser with validation for map definitions

use crate::dag::topological_order;
use crate::error::{MapflowError, Result};
use crate::models::*;
use crate::schedule::validate_cron_expression;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path};

/// Parse a map definition from a YAML file.
///
/// Enforces the same limits as [`parse_map_yaml`].
///
/// # Example
///
/// ```no_run
/// use mapflow::parser::parse_map_file;
///
/// let definition = parse_map_file("maps/nightly.yaml")?;
/// println!("Loaded map: {}", definition.name);
/// # Ok::<(), mapflow::error::MapflowError>(())
/// ```
pub fn parse_map_file<P: AsRef<Path>>(path: P) -> Result<MapDefinition> {
    let content = fs::read_to_string(path)?;
    parse_map_yaml(&content)
}

/// Parse a map definition from a YAML string.
///
/// Validation performed:
/// - definition size must be <= 1MB
/// - step count must be <= 1,000
/// - step names must be alphanumeric + underscore/dash and unique
/// - every `depends_on` entry must name a step of the same map
/// - the dependency graph must be acyclic
/// - the schedule must be a valid cron expression
/// - commands must be non-empty, bounded and must not escape the working directory
///
/// # Example
///
/// ```
/// use mapflow::parser::parse_map_yaml;
///
/// let yaml = r#"
/// name: nightly
/// schedule: "0 2 * * *"
/// steps:
///   - name: extract
///     command: etl/extract.py
///   - name: load
///     command: etl/load.py
///     depends_on: [extract]
/// "#;
///
/// let definition = parse_map_yaml(yaml)?;
/// assert_eq!(definition.steps.len(), 2);
/// # Ok::<(), mapflow::error::MapflowError>(())
/// ```
pub fn parse_map_yaml(content: &str) -> Result<MapDefinition> {
    if content.len() > MAX_DEFINITION_SIZE {
        return Err(MapflowError::DefinitionSizeExceeded(content.len()));
    }

    let definition: MapDefinition = serde_yaml::from_str(content)?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Validate an already deserialized definition
pub fn validate_definition(definition: &MapDefinition) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(MapflowError::Validation("Map name must not be empty".to_string()));
    }

    if definition.steps.len() > MAX_STEP_COUNT {
        return Err(MapflowError::StepCountExceeded {
            count: definition.steps.len(),
            limit: MAX_STEP_COUNT,
        });
    }

    validate_cron_expression(&definition.schedule)?;

    let mut seen_names = HashSet::with_capacity(definition.steps.len());
    for step in &definition.steps {
        validate_step_name(&step.name)?;
        if !seen_names.insert(step.name.as_str()) {
            return Err(MapflowError::Validation(format!(
                "Duplicate step name '{}'",
                step.name
            )));
        }
        validate_command(&step.command)?;
    }

    // Rejects missing dependencies and cycles
    topological_order(&draft_steps(definition)?)?;

    Ok(())
}

/// Steps of a definition with provisional IDs (1-based position) and
/// dependencies resolved by name.
pub(crate) fn draft_steps(definition: &MapDefinition) -> Result<Vec<Step>> {
    let ids: HashMap<&str, StepId> = definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i as StepId + 1))
        .collect();

    definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let dependencies = s
                .depends_on
                .iter()
                .map(|dep| {
                    ids.get(dep.as_str())
                        .copied()
                        .ok_or_else(|| MapflowError::MissingDependency {
                            step: s.name.clone(),
                            dependency: dep.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut step = Step::new(&s.name, 0, &s.command).with_dependencies(dependencies);
            step.id = i as StepId + 1;
            Ok(step)
        })
        .collect()
}

fn validate_step_name(name: &str) -> Result<()> {
    if name.len() > MAX_STEP_NAME_LEN {
        return Err(MapflowError::StepNameTooLong {
            name: name.to_string(),
            max: MAX_STEP_NAME_LEN,
        });
    }

    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MapflowError::InvalidStepName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Check a step command reference.
///
/// The first whitespace-separated token is the program or script path; a
/// relative path must stay below the working directory.
pub fn validate_command(command: &str) -> Result<()> {
    if command.len() > MAX_COMMAND_LEN {
        return Err(MapflowError::CommandTooLong {
            limit: MAX_COMMAND_LEN,
        });
    }

    let program = command
        .split_whitespace()
        .next()
        .ok_or_else(|| MapflowError::InvalidPath("empty command".to_string()))?;

    if Path::new(program)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(MapflowError::PathTraversal(program.to_string()));
    }

    Ok(())
}
