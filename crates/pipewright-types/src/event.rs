//! Progress event types for the Pipewright engine.
//!
//! `ProgressEvent` is the unified event type emitted on a run's outgoing
//! stream. All variants are Clone + Send + Sync and serde-serializable so
//! consumers can render them live or persist them as NDJSON.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::StepStatus;

/// Events emitted during workflow execution.
///
/// Every run emits exactly one `WorkflowStarted` first and exactly one
/// `WorkflowCompleted` last, regardless of outcome. A given step's
/// `StepStarted` strictly precedes its terminal `StepCompleted`; across
/// concurrent siblings arrival order carries no meaning -- consumers key by
/// step name or loop index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A workflow run has started.
    WorkflowStarted {
        run_id: Uuid,
        workflow_name: String,
    },

    /// A workflow run has finished (success or not).
    WorkflowCompleted {
        run_id: Uuid,
        workflow_name: String,
        success: bool,
        duration_ms: u64,
    },

    /// A step's handler (or native runner) is about to be invoked.
    StepStarted {
        run_id: Uuid,
        step_name: String,
        step_type: String,
    },

    /// A step reached its terminal status. Skipped and cancelled steps emit
    /// this without a preceding `StepStarted`.
    StepCompleted {
        run_id: Uuid,
        step_name: String,
        status: StepStatus,
        duration_ms: u64,
    },

    /// One loop iteration is starting. `index` is the fixed position in the
    /// item sequence; `label` is display metadata derived from the item.
    LoopIterationStarted {
        run_id: Uuid,
        loop_name: String,
        index: usize,
        label: String,
        /// Name of the enclosing loop, when this loop is nested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_loop: Option<String>,
    },

    /// One loop iteration reached a terminal status.
    LoopIterationCompleted {
        run_id: Uuid,
        loop_name: String,
        index: usize,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_loop: Option<String>,
    },

    /// A validate step is running its stage list.
    ValidationStarted {
        run_id: Uuid,
        step_name: String,
        stages: Vec<String>,
    },

    /// All validation stages passed.
    ValidationCompleted {
        run_id: Uuid,
        step_name: String,
    },

    /// A validation stage failed.
    ValidationFailed {
        run_id: Uuid,
        step_name: String,
        error: String,
    },

    /// A completed step's rollback is being invoked.
    RollbackStarted {
        run_id: Uuid,
        /// The completed step being compensated.
        for_step: String,
        /// Name of the rollback step being dispatched.
        rollback_step: String,
    },

    /// A rollback step completed.
    RollbackCompleted {
        run_id: Uuid,
        for_step: String,
    },

    /// A rollback step itself failed (reported, never raised).
    RollbackError {
        run_id: Uuid,
        for_step: String,
        error: String,
    },

    /// A checkpoint was persisted to the store.
    CheckpointSaved {
        run_id: Uuid,
        /// Label of an explicit checkpoint step; None for automatic saves.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl ProgressEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            ProgressEvent::WorkflowStarted { run_id, .. }
            | ProgressEvent::WorkflowCompleted { run_id, .. }
            | ProgressEvent::StepStarted { run_id, .. }
            | ProgressEvent::StepCompleted { run_id, .. }
            | ProgressEvent::LoopIterationStarted { run_id, .. }
            | ProgressEvent::LoopIterationCompleted { run_id, .. }
            | ProgressEvent::ValidationStarted { run_id, .. }
            | ProgressEvent::ValidationCompleted { run_id, .. }
            | ProgressEvent::ValidationFailed { run_id, .. }
            | ProgressEvent::RollbackStarted { run_id, .. }
            | ProgressEvent::RollbackCompleted { run_id, .. }
            | ProgressEvent::RollbackError { run_id, .. }
            | ProgressEvent::CheckpointSaved { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_started_serde() {
        let event = ProgressEvent::WorkflowStarted {
            run_id: Uuid::now_v7(),
            workflow_name: "ship-feature".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ProgressEvent::WorkflowStarted { .. }));
    }

    #[test]
    fn test_step_completed_serde() {
        let event = ProgressEvent::StepCompleted {
            run_id: Uuid::now_v7(),
            step_name: "implement".to_string(),
            status: StepStatus::Completed,
            duration_ms: 900,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            ProgressEvent::StepCompleted {
                status: StepStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_loop_iteration_events_carry_parent() {
        let run_id = Uuid::now_v7();
        let event = ProgressEvent::LoopIterationStarted {
            run_id,
            loop_name: "inner".to_string(),
            index: 3,
            label: "Item 3".to_string(),
            parent_loop: Some("outer".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"parent_loop\":\"outer\""));
        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            ProgressEvent::LoopIterationStarted {
                index, parent_loop, ..
            } => {
                assert_eq!(index, 3);
                assert_eq!(parent_loop.as_deref(), Some("outer"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_saved_omits_null_label() {
        let event = ProgressEvent::CheckpointSaved {
            run_id: Uuid::now_v7(),
            label: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("label"));
    }

    #[test]
    fn test_run_id_accessor_covers_all_variants() {
        let run_id = Uuid::now_v7();
        let events = vec![
            ProgressEvent::WorkflowStarted {
                run_id,
                workflow_name: "w".to_string(),
            },
            ProgressEvent::ValidationFailed {
                run_id,
                step_name: "check".to_string(),
                error: "tests failed".to_string(),
            },
            ProgressEvent::RollbackError {
                run_id,
                for_step: "publish".to_string(),
                error: "remote rejected".to_string(),
            },
        ];
        for event in events {
            assert_eq!(event.run_id(), run_id);
        }
    }
}
