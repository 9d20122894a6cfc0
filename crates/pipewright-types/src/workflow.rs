//! Workflow domain types for Pipewright.
//!
//! Defines the canonical intermediate representation for workflows: YAML files
//! and programmatic construction both produce a `WorkflowDefinition`, which is
//! the single source of truth for a workflow's shape. This module also contains
//! execution tracking types (`StepResult`, `WorkflowResult`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Produced by the YAML loader (or constructed programmatically), validated
/// once before execution, and read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name (alphanumeric + hyphens).
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs with type, required flag, and default.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Ordered list of top-level steps.
    pub steps: Vec<Step>,
    /// Output name -> expression, evaluated against the final context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Input name referenced as `inputs.<name>` in expressions.
    pub name: String,
    /// Expected value type.
    #[serde(rename = "type", default)]
    pub ty: InputType,
    /// Whether the caller must supply a value (default true).
    #[serde(default = "default_required")]
    pub required: bool,
    /// Default value used when the input is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

/// The JSON type an input value must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl InputType {
    /// Check whether a JSON value matches this input type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single step in a workflow.
///
/// The kind-specific payload is flattened into the step, so YAML reads:
/// ```yaml
/// - name: implement
///   type: agent_call
///   capability: implement-change
///   context:
///     task: "{{ inputs.task }}"
///   retry:
///     max_attempts: 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within its sibling scope.
    pub name: String,
    /// Optional condition expression; the step is skipped when it is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Fallback step dispatched after all attempts are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<Step>>,
    /// Compensation step invoked during a rollback pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Box<Step>>,
    /// The kind of step and its payload.
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Kind-specific step payload, internally tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A named deterministic operation with arguments.
    Action {
        action: String,
        #[serde(default)]
        args: serde_json::Map<String, Value>,
    },
    /// Delegate a judgment call to an AI agent capability.
    AgentCall {
        capability: String,
        #[serde(default)]
        context: serde_json::Map<String, Value>,
    },
    /// Generate text (commit message, PR body) via a named generator.
    TextGenerate {
        generator: String,
        #[serde(default)]
        context: serde_json::Map<String, Value>,
    },
    /// Run a named list of validation stages.
    Validate { stages: Vec<String> },
    /// A fixed set of sibling steps executed concurrently.
    Parallel {
        steps: Vec<Step>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Iterate body steps over a fixed item sequence.
    Loop {
        /// Expression producing the item array, evaluated once at loop entry.
        items: String,
        /// Name bound to the current item inside the body (default "item").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_var: Option<String>,
        body: Vec<Step>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Invoke another workflow by name with an input mapping.
    Subworkflow {
        workflow: String,
        #[serde(default)]
        inputs: BTreeMap<String, String>,
    },
    /// Persist a durable checkpoint at this position.
    Checkpoint { label: String },
}

impl Step {
    /// Machine-readable step type name (used in events and logs).
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Action { .. } => "action",
            StepKind::AgentCall { .. } => "agent_call",
            StepKind::TextGenerate { .. } => "text_generate",
            StepKind::Validate { .. } => "validate",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Loop { .. } => "loop",
            StepKind::Subworkflow { .. } => "subworkflow",
            StepKind::Checkpoint { .. } => "checkpoint",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3, must be >= 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait `base_delay_ms * 2^(attempt-1)` before the next attempt.
    Exponential { base_delay_ms: u64 },
}

// ---------------------------------------------------------------------------
// Execution status and results
// ---------------------------------------------------------------------------

/// Terminal status of a step (or loop iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Terminal record for one dispatched step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name (unique within `scope`).
    pub name: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Output value recorded into the context (Completed steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error text for Failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
    /// Number of handler invocations (0 for skipped/cancelled steps).
    pub attempts: u32,
    /// Context scope the output belongs to: `""` for the top-level sequence,
    /// `"deploy[2]"` for body steps of iteration 2 of loop `deploy`, nested
    /// scopes joined with `/`. Lets a resumed run rehydrate outputs into the
    /// exact scope that produced them.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl StepResult {
    /// Build a result for a step that never ran (skipped or cancelled).
    pub fn unstarted(name: impl Into<String>, status: StepStatus, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            output: None,
            error: None,
            duration_ms: 0,
            attempts: 0,
            scope: scope.into(),
        }
    }
}

/// Final result of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// True when every dispatched step ended Completed or Skipped.
    pub success: bool,
    /// All terminal step results, in completion order.
    pub results: Vec<StepResult>,
    /// Workflow outputs evaluated from the definition's output mapping
    /// (empty on failure).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
    /// Total run duration.
    pub duration_ms: u64,
    /// Error text describing the first unrecovered failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
