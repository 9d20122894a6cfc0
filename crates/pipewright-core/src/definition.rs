//! Workflow definition parsing and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition` IR and
//! provides discovery for workflow files on disk. Parsing always runs the
//! validator, so a definition obtained through this module is guaranteed to
//! be structurally valid.

use std::path::{Path, PathBuf};

use pipewright_types::workflow::WorkflowDefinition;
use thiserror::Error;

use crate::validate::{validate_definition, ValidationError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or saving workflow definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans `.yaml`/`.yml` files recursively. Files that fail to parse or
/// validate are skipped with a warning -- they may not be workflows at all.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(err) => {
                        tracing::warn!(?path, %err, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
name: fix-and-ship
version: "1.0.0"
inputs:
  - name: task
steps:
  - name: implement
    type: agent_call
    capability: implement-change
    context:
      task: "{{ inputs.task }}"
  - name: validate
    type: validate
    stages: [build, tests]
outputs:
  changed: steps.implement.output
"#;

    #[test]
    fn test_parse_yaml_roundtrip() {
        let def = parse_workflow_yaml(VALID_YAML).expect("should parse");
        assert_eq!(def.name, "fix-and-ship");
        assert_eq!(def.steps.len(), 2);

        let yaml = serialize_workflow_yaml(&def).expect("should serialize");
        let def2 = parse_workflow_yaml(&yaml).expect("should re-parse");
        assert_eq!(def2.name, def.name);
        assert_eq!(def2.steps.len(), def.steps.len());
    }

    #[test]
    fn test_parse_rejects_invalid_structure() {
        let err = parse_workflow_yaml("name: [not, a, workflow]").unwrap_err();
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_invalid_definition() {
        // Valid YAML shape, but fails validation (forward reference)
        let yaml = r#"
name: bad
version: "1.0.0"
steps:
  - name: first
    type: action
    action: echo
    when: "steps.second.output == 'x'"
  - name: second
    type: action
    action: echo
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::Validation(_)));
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/ship.yaml");

        let def = parse_workflow_yaml(VALID_YAML).unwrap();
        save_workflow_file(&path, &def).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded.name, "fix-and-ship");
    }

    #[test]
    fn test_discover_workflows_skips_non_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_workflow_yaml(VALID_YAML).unwrap();
        save_workflow_file(&dir.path().join("a.yaml"), &def).unwrap();
        save_workflow_file(&dir.path().join("sub/b.yml"), &def).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_workflows(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}
