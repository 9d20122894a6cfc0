//! Workflow execution context with write-once step outputs and loop frames.
//!
//! `WorkflowContext` is the state that flows through a run. Sequential steps
//! mutate it in place; concurrent branches (parallel children, loop
//! iterations) run on snapshots and merge their new outputs back at the join
//! point, which keeps the write-once invariant conflict-free by construction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by context mutations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A step output was written twice -- an engine invariant violation.
    #[error("output for step '{0}' was already recorded")]
    DuplicateOutput(String),

    /// Total context size exceeded the cap.
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    ContextTooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Loop frame
// ---------------------------------------------------------------------------

/// One active loop's variables. Frames stack for nested loops; expression
/// resolution sees the innermost frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFrame {
    /// Name the item is bound to in expressions (default "item").
    pub var: String,
    /// The current item, fixed for the iteration.
    pub item: Value,
    /// Zero-based iteration index.
    pub index: usize,
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable execution state for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Workflow name.
    pub workflow_name: String,
    /// Run ID.
    pub run_id: Uuid,
    /// Resolved input values (defaults applied).
    pub inputs: BTreeMap<String, Value>,
    /// Step outputs keyed by step name. Append-only, write-once.
    step_outputs: BTreeMap<String, Value>,
    /// Stack of active loop frames, innermost last.
    loop_frames: Vec<LoopFrame>,
}

impl WorkflowContext {
    /// Create a fresh context for a run.
    pub fn new(workflow_name: String, run_id: Uuid, inputs: BTreeMap<String, Value>) -> Self {
        Self {
            workflow_name,
            run_id,
            inputs,
            step_outputs: BTreeMap::new(),
            loop_frames: Vec::new(),
        }
    }

    /// Record the output of a completed step.
    ///
    /// A second write to the same name is an engine bug (sibling-name
    /// uniqueness is validated before execution) and returns an error rather
    /// than clobbering. Outputs above [`MAX_STEP_OUTPUT_SIZE`] are replaced
    /// with a truncation marker; the total context is capped at
    /// [`MAX_CONTEXT_SIZE`].
    pub fn set_step_output(&mut self, step_name: &str, output: Value) -> Result<(), ContextError> {
        if self.step_outputs.contains_key(step_name) {
            return Err(ContextError::DuplicateOutput(step_name.to_string()));
        }

        let serialized_len = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        if serialized_len > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_name,
                size = serialized_len,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized_len,
            });
            self.step_outputs.insert(step_name.to_string(), truncated);
        } else {
            self.step_outputs.insert(step_name.to_string(), output);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::ContextTooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        Ok(())
    }

    /// Get the output of a completed step.
    pub fn step_output(&self, step_name: &str) -> Option<&Value> {
        self.step_outputs.get(step_name)
    }

    /// Whether a step already has a recorded output.
    pub fn has_step_output(&self, step_name: &str) -> bool {
        self.step_outputs.contains_key(step_name)
    }

    /// Push a loop frame for one iteration. Popped on iteration exit.
    pub fn push_loop_frame(&mut self, var: String, item: Value, index: usize) {
        self.loop_frames.push(LoopFrame { var, item, index });
    }

    /// Pop the innermost loop frame.
    pub fn pop_loop_frame(&mut self) {
        self.loop_frames.pop();
    }

    /// The innermost loop frame, if any.
    pub fn innermost_frame(&self) -> Option<&LoopFrame> {
        self.loop_frames.last()
    }

    /// Merge outputs produced by a concurrent child back into this context.
    ///
    /// Only names absent from this context are merged; sibling-name
    /// uniqueness guarantees no two children produce the same name, so a
    /// conflict here is an engine bug.
    pub fn merge_outputs_from(&mut self, child: &WorkflowContext) -> Result<(), ContextError> {
        for (name, output) in &child.step_outputs {
            if !self.step_outputs.contains_key(name) {
                self.set_step_output(name, output.clone())?;
            }
        }
        Ok(())
    }

    /// Total serialized size of inputs and outputs in bytes.
    pub fn total_size(&self) -> usize {
        let outputs: usize = self
            .step_outputs
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        let inputs: usize = self
            .inputs
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        outputs + inputs
    }

    /// Build the JSON object expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "inputs": { ... },
    ///   "steps": { "<name>": { "output": <value> }, ... },
    ///   "item": <innermost loop item>,       // only inside a loop
    ///   "index": <innermost loop index>,     // only inside a loop
    ///   "workflow": { "name": "...", "run_id": "..." }
    /// }
    /// ```
    ///
    /// When a loop declares `item_var`, the item is bound under that name as
    /// well as `item`; outer frames' names stay visible unless shadowed.
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (name, output) in &self.step_outputs {
            steps.insert(name.clone(), json!({ "output": output }));
        }

        let mut root = serde_json::Map::new();
        root.insert("inputs".to_string(), json!(self.inputs));
        root.insert("steps".to_string(), Value::Object(steps));
        root.insert(
            "workflow".to_string(),
            json!({
                "name": self.workflow_name,
                "run_id": self.run_id.to_string(),
            }),
        );

        // Outer frames first so inner frames shadow them
        for frame in &self.loop_frames {
            root.insert(frame.var.clone(), frame.item.clone());
            if frame.var != "item" {
                root.insert("item".to_string(), frame.item.clone());
            }
            root.insert("index".to_string(), json!(frame.index));
        }

        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
