//! Checkpoint state for mid-run persistence and resumption.
//!
//! A `CheckpointState` captures everything needed to resume a partially
//! completed run without re-executing finished work: the input snapshot, the
//! ordered step results produced so far, and a resume cursor describing the
//! nested position at which execution continues.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{StepResult, StepStatus};

/// One nesting level of the resume cursor.
///
/// `scope` is `""` for the top-level sequence; a loop contributes a frame
/// keyed by the loop step name whose index is the iteration, followed by a
/// `"<loop>.body"` frame whose index is the next body step. `index` is always
/// the next position to execute within that scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorFrame {
    pub scope: String,
    pub index: usize,
}

impl CursorFrame {
    pub fn new(scope: impl Into<String>, index: usize) -> Self {
        Self {
            scope: scope.into(),
            index,
        }
    }
}

/// Persisted snapshot of a partially completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Name of the workflow this run belongs to.
    pub workflow_name: String,
    /// Version of the definition the run was started with. A resume against a
    /// different version is refused.
    pub workflow_version: String,
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    /// Resolved input values (defaults already applied).
    pub inputs: BTreeMap<String, Value>,
    /// All terminal step results produced before this checkpoint, in
    /// completion order.
    pub results: Vec<StepResult>,
    /// Nested position at which a resumed run continues.
    pub cursor: Vec<CursorFrame>,
    /// Label of the explicit checkpoint step that produced this state;
    /// None for automatic after-step checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When this checkpoint was persisted.
    pub saved_at: DateTime<Utc>,
}

impl CheckpointState {
    /// Completed step outputs for a given scope, in completion order.
    ///
    /// Used on resume to rehydrate a context's output map without
    /// re-executing steps.
    pub fn outputs_for_scope(&self, scope: &str) -> Vec<(&str, &Value)> {
        self.results
            .iter()
            .filter(|r| r.scope == scope && r.status == StepStatus::Completed)
            .filter_map(|r| r.output.as_ref().map(|o| (r.name.as_str(), o)))
            .collect()
    }

    /// Names of steps in a scope that already reached a terminal status.
    pub fn settled_in_scope(&self, scope: &str) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.scope == scope)
            .map(|r| r.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> CheckpointState {
        CheckpointState {
            workflow_name: "ship-feature".to_string(),
            workflow_version: "1.0.0".to_string(),
            run_id: Uuid::now_v7(),
            inputs: BTreeMap::from([("task".to_string(), json!("fix the parser"))]),
            results: vec![
                StepResult {
                    name: "implement".to_string(),
                    status: StepStatus::Completed,
                    output: Some(json!(["src/parser.rs"])),
                    error: None,
                    duration_ms: 1500,
                    attempts: 1,
                    scope: String::new(),
                },
                StepResult {
                    name: "review-file".to_string(),
                    status: StepStatus::Completed,
                    output: Some(json!("lgtm")),
                    error: None,
                    duration_ms: 400,
                    attempts: 1,
                    scope: "per-file[0]".to_string(),
                },
                StepResult {
                    name: "flaky".to_string(),
                    status: StepStatus::Failed,
                    output: None,
                    error: Some("boom".to_string()),
                    duration_ms: 10,
                    attempts: 3,
                    scope: String::new(),
                },
            ],
            cursor: vec![
                CursorFrame::new("", 2),
                CursorFrame::new("per-file", 1),
                CursorFrame::new("per-file.body", 0),
            ],
            label: Some("after-review".to_string()),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_checkpoint_state_json_roundtrip() {
        let state = sample_state();
        let json_str = serde_json::to_string_pretty(&state).unwrap();
        let parsed: CheckpointState = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.workflow_name, "ship-feature");
        assert_eq!(parsed.results.len(), 3);
        assert_eq!(parsed.cursor.len(), 3);
        assert_eq!(parsed.cursor[1], CursorFrame::new("per-file", 1));
        assert_eq!(parsed.label.as_deref(), Some("after-review"));
    }

    #[test]
    fn test_outputs_for_scope_filters_completed() {
        let state = sample_state();
        let top = state.outputs_for_scope("");
        // "flaky" failed, so only "implement" has an output at top level
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "implement");

        let iteration = state.outputs_for_scope("per-file[0]");
        assert_eq!(iteration.len(), 1);
        assert_eq!(iteration[0].1, &json!("lgtm"));
    }

    #[test]
    fn test_settled_in_scope_includes_failures() {
        let state = sample_state();
        let settled = state.settled_in_scope("");
        assert_eq!(settled, vec!["implement", "flaky"]);
    }
}
