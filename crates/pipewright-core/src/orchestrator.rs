//! Top-level workflow driver.
//!
//! The orchestrator owns the per-run wiring: it validates the definition,
//! resolves inputs, builds the `RunEngine`, walks the top-level step
//! sequence, auto-checkpoints after each top-level step, runs the rollback
//! pass on failure, and computes the output mapping on success.
//!
//! Event bounding is unconditional: every run emits exactly one
//! `WorkflowStarted` first and exactly one `WorkflowCompleted` last -- even
//! when validation fails, a required input is missing, or the run is
//! cancelled. Nothing escapes `RunHandle::join()` as a panic; the result's
//! `success` flag and the event stream are the only failure surfaces.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use pipewright_types::checkpoint::{CheckpointState, CursorFrame};
use pipewright_types::event::ProgressEvent;
use pipewright_types::workflow::{
    Step, StepKind, StepResult, StepStatus, WorkflowDefinition, WorkflowResult,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::context::WorkflowContext;
use crate::dispatcher::{RunEngine, ScopePath};
use crate::events::EventSink;
use crate::expression::Evaluator;
use crate::handler::{HandlerKind, HandlerRegistry};
use crate::validate::{validate_definition, ValidationError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Pre-start failures. These never surface as panics or raised errors from a
/// run -- they become the run's `error` text with `success = false`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no handler registered for step types: {0}")]
    MissingHandlers(String),

    #[error("required input '{0}' was not provided")]
    MissingInput(String),

    #[error("input '{name}' has the wrong type (expected {expected})")]
    InputType { name: String, expected: String },

    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A started run: the live event stream plus the eventual result.
///
/// Typical consumption drains the events until the channel closes, then
/// joins:
///
/// ```ignore
/// let mut run = orchestrator.start(definition, inputs);
/// while let Some(event) = run.events.recv().await { render(event); }
/// let result = run.join().await;
/// ```
pub struct RunHandle {
    pub run_id: Uuid,
    /// Ordered progress events; closes when the run finishes.
    pub events: mpsc::UnboundedReceiver<ProgressEvent>,
    workflow_name: String,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<WorkflowResult>,
}

impl RunHandle {
    /// Request cooperative cancellation: work already dispatched runs to
    /// completion, everything not yet started is marked Cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the final result. Never panics; a crashed drive task is
    /// reported as a failed result.
    pub async fn join(self) -> WorkflowResult {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => WorkflowResult {
                run_id: self.run_id,
                workflow_name: self.workflow_name,
                success: false,
                results: vec![],
                outputs: BTreeMap::new(),
                duration_ms: 0,
                error: Some(format!("run task aborted: {err}")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes workflows against an injected handler registry and checkpoint
/// store. One orchestrator serves many concurrent runs; cancellation tokens
/// are tracked per run.
pub struct Orchestrator<S: CheckpointStore> {
    handlers: Arc<HandlerRegistry>,
    checkpoints: Arc<CheckpointManager<S>>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<S: CheckpointStore + Send + Sync + 'static> Orchestrator<S> {
    pub fn new(handlers: HandlerRegistry, store: S) -> Self {
        Self {
            handlers: Arc::new(handlers),
            checkpoints: Arc::new(CheckpointManager::new(store)),
            cancel_tokens: Arc::new(DashMap::new()),
        }
    }

    /// Access the checkpoint manager (run listings, manual cleanup).
    pub fn checkpoints(&self) -> Arc<CheckpointManager<S>> {
        Arc::clone(&self.checkpoints)
    }

    /// Start a new run. Must be called within a tokio runtime.
    pub fn start(
        &self,
        definition: WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> RunHandle {
        self.launch(definition, inputs, Uuid::now_v7(), false)
    }

    /// Resume a previously checkpointed run. Completed work is rehydrated
    /// from the stored results, never re-executed.
    pub fn resume(&self, definition: WorkflowDefinition, run_id: Uuid) -> RunHandle {
        self.launch(definition, BTreeMap::new(), run_id, true)
    }

    /// Cooperatively cancel a run by ID. Returns false when unknown.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancel_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn launch(
        &self,
        definition: WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
        run_id: Uuid,
        resuming: bool,
    ) -> RunHandle {
        let (sink, events) = EventSink::channel();
        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(run_id, cancel.clone());

        let workflow_name = definition.name.clone();
        let handlers = Arc::clone(&self.handlers);
        let checkpoints = Arc::clone(&self.checkpoints);
        let tokens = Arc::clone(&self.cancel_tokens);
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let result = drive(
                definition,
                inputs,
                run_id,
                resuming,
                handlers,
                checkpoints,
                sink,
                task_cancel,
            )
            .await;
            tokens.remove(&run_id);
            result
        });

        RunHandle {
            run_id,
            events,
            workflow_name,
            cancel,
            handle,
        }
    }
}

// ---------------------------------------------------------------------------
// Drive loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn drive<S: CheckpointStore + Send + Sync + 'static>(
    definition: WorkflowDefinition,
    provided_inputs: BTreeMap<String, Value>,
    run_id: Uuid,
    resuming: bool,
    handlers: Arc<HandlerRegistry>,
    checkpoints: Arc<CheckpointManager<S>>,
    sink: EventSink,
    cancel: CancellationToken,
) -> WorkflowResult {
    sink.emit(ProgressEvent::WorkflowStarted {
        run_id,
        workflow_name: definition.name.clone(),
    });
    tracing::info!(
        run_id = %run_id,
        workflow = definition.name.as_str(),
        resuming,
        "starting workflow run"
    );
    let started = Instant::now();

    let (success, results, outputs, error) = drive_inner(
        &definition,
        provided_inputs,
        run_id,
        resuming,
        handlers,
        checkpoints,
        &sink,
        &cancel,
    )
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    sink.emit(ProgressEvent::WorkflowCompleted {
        run_id,
        workflow_name: definition.name.clone(),
        success,
        duration_ms,
    });
    tracing::info!(
        run_id = %run_id,
        workflow = definition.name.as_str(),
        success,
        duration_ms,
        "workflow run finished"
    );

    WorkflowResult {
        run_id,
        workflow_name: definition.name,
        success,
        results,
        outputs,
        duration_ms,
        error,
    }
}

type DriveOutcome = (
    bool,
    Vec<StepResult>,
    BTreeMap<String, Value>,
    Option<String>,
);

#[allow(clippy::too_many_arguments)]
async fn drive_inner<S: CheckpointStore + Send + Sync + 'static>(
    definition: &WorkflowDefinition,
    provided_inputs: BTreeMap<String, Value>,
    run_id: Uuid,
    resuming: bool,
    handlers: Arc<HandlerRegistry>,
    checkpoints: Arc<CheckpointManager<S>>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> DriveOutcome {
    let fail =
        |err: OrchestratorError| (false, vec![], BTreeMap::new(), Some(err.to_string()));

    // Hard gate: the workflow never starts executing steps when invalid.
    if let Err(err) = validate_definition(definition) {
        return fail(err.into());
    }

    let missing = handlers.missing_for(definition);
    if !missing.is_empty() {
        let list: Vec<String> = missing.iter().map(HandlerKind::to_string).collect();
        return fail(OrchestratorError::MissingHandlers(list.join(", ")));
    }

    // Resume state supplies inputs and prior results; a fresh run resolves
    // inputs against the declared schema.
    let resume_state = if resuming {
        match checkpoints
            .load_for_resume(run_id, &definition.version)
            .await
        {
            Ok(state) => Some(Arc::new(state)),
            Err(err) => return fail(err.into()),
        }
    } else {
        None
    };

    let inputs = match &resume_state {
        Some(state) => state.inputs.clone(),
        None => match resolve_inputs(definition, provided_inputs) {
            Ok(inputs) => inputs,
            Err(err) => return fail(err),
        },
    };

    let mut ctx = WorkflowContext::new(definition.name.clone(), run_id, inputs.clone());
    let prior_results = resume_state
        .as_ref()
        .map(|state| state.results.clone())
        .unwrap_or_default();
    if let Some(state) = &resume_state {
        for (name, output) in state.outputs_for_scope("") {
            if let Err(err) = ctx.set_step_output(name, output.clone()) {
                tracing::warn!(%err, "failed to rehydrate step output from checkpoint");
            }
        }
    }

    let (resume_top, resume_deeper) = match resume_state.as_ref().map(|s| s.cursor.clone()) {
        Some(cursor) if cursor.first().is_some_and(|f| f.scope.is_empty()) => {
            let top = cursor[0].index;
            let deeper = (cursor.len() > 1).then(|| cursor[1..].to_vec());
            (top, deeper)
        }
        _ => (0, None),
    };
    if resuming {
        tracing::info!(
            run_id = %run_id,
            resume_top,
            rehydrated = prior_results.len(),
            "resuming from checkpoint"
        );
    }

    let engine = Arc::new(RunEngine {
        definition: Arc::new(definition.clone()),
        run_id,
        inputs,
        handlers,
        evaluator: Evaluator::new(),
        sink: sink.clone(),
        checkpoints,
        results: Mutex::new(prior_results),
        resume_state,
    });

    let mut halted = false;
    let mut failed = false;
    let mut error: Option<String> = None;

    for (index, step) in definition.steps.iter().enumerate() {
        // Steps completed before the checkpoint are not re-invoked; their
        // outputs came from the rehydrated results.
        if index < resume_top {
            continue;
        }

        if halted || cancel.is_cancelled() {
            let result = StepResult::unstarted(&step.name, StepStatus::Cancelled, "");
            engine.record_result(&result);
            halted = true;
            continue;
        }

        let deeper = (index == resume_top)
            .then(|| resume_deeper.clone())
            .flatten();
        let (result, next_ctx) = Arc::clone(&engine)
            .execute_step(
                step.clone(),
                ctx,
                ScopePath::root(index),
                cancel.clone(),
                deeper,
            )
            .await;
        ctx = next_ctx;

        match result.status {
            StepStatus::Completed | StepStatus::Skipped => {
                // Best-effort automatic checkpoint after each top-level step
                let state =
                    engine.checkpoint_state(None, vec![CursorFrame::new("", index + 1)]);
                if engine.checkpoints.save_auto(&state).await {
                    sink.emit(ProgressEvent::CheckpointSaved {
                        run_id,
                        label: None,
                    });
                }
            }
            StepStatus::Failed => {
                failed = true;
                halted = true;
                error = Some(format!(
                    "step '{}' failed: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }
            StepStatus::Cancelled => {
                halted = true;
                error.get_or_insert_with(|| "run cancelled".to_string());
            }
        }
    }

    // Rollback pass: only unrecovered *failures* trigger it, in reverse
    // completion order of the top-level scope.
    if failed {
        rollback_pass(&engine, &ctx, definition).await;
    }

    let success = !halted;

    let outputs = if success {
        match compute_outputs(definition, &ctx) {
            Ok(outputs) => outputs,
            Err(err) => {
                return (
                    false,
                    engine.results.lock().expect("results mutex poisoned").clone(),
                    BTreeMap::new(),
                    Some(err),
                );
            }
        }
    } else {
        BTreeMap::new()
    };

    let results = engine
        .results
        .lock()
        .expect("results mutex poisoned")
        .clone();
    (success, results, outputs, error)
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Apply declared defaults and verify required inputs and their types.
fn resolve_inputs(
    definition: &WorkflowDefinition,
    provided: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, OrchestratorError> {
    let mut resolved = provided;
    for spec in &definition.inputs {
        match resolved.get(&spec.name) {
            Some(value) => {
                if !spec.ty.matches(value) {
                    return Err(OrchestratorError::InputType {
                        name: spec.name.clone(),
                        expected: format!("{:?}", spec.ty).to_lowercase(),
                    });
                }
            }
            None => {
                if let Some(default) = &spec.default {
                    resolved.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(OrchestratorError::MissingInput(spec.name.clone()));
                }
            }
        }
    }
    Ok(resolved)
}

/// Evaluate the definition's output mapping against the final context.
fn compute_outputs(
    definition: &WorkflowDefinition,
    ctx: &WorkflowContext,
) -> Result<BTreeMap<String, Value>, String> {
    let evaluator = Evaluator::new();
    let expr_ctx = ctx.to_expression_context();
    let mut outputs = BTreeMap::new();
    for (name, expr) in &definition.outputs {
        let value = evaluator
            .evaluate(expr, &expr_ctx)
            .map_err(|err| format!("failed to compute output '{name}': {err}"))?;
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

// ---------------------------------------------------------------------------
// Rollback pass
// ---------------------------------------------------------------------------

/// Invoke each already-completed top-scope step's rollback, in reverse
/// completion order. Rollback failures are reported via events and logs,
/// never raised.
async fn rollback_pass<S: CheckpointStore + Send + Sync + 'static>(
    engine: &Arc<RunEngine<S>>,
    ctx: &WorkflowContext,
    definition: &WorkflowDefinition,
) {
    let completed: Vec<String> = {
        let results = engine.results.lock().expect("results mutex poisoned");
        results
            .iter()
            .filter(|r| r.scope.is_empty() && r.status == StepStatus::Completed)
            .map(|r| r.name.clone())
            .collect()
    };

    let mut top_scope_steps = HashMap::new();
    collect_top_scope_steps(&definition.steps, &mut top_scope_steps);

    let mut position = 0;
    for name in completed.iter().rev() {
        let Some(step) = top_scope_steps.get(name) else {
            continue;
        };
        let Some(rollback) = &step.rollback else {
            continue;
        };

        engine.sink.emit(ProgressEvent::RollbackStarted {
            run_id: engine.run_id,
            for_step: name.clone(),
            rollback_step: rollback.name.clone(),
        });
        tracing::info!(
            run_id = %engine.run_id,
            step = name.as_str(),
            rollback = rollback.name.as_str(),
            "rolling back completed step"
        );

        // Rollback runs on its own token: compensation is not interruptible
        // by the cancellation that may have accompanied the failure.
        let path = ScopePath::root(definition.steps.len()).push("rollback", position);
        position += 1;
        let (result, _ctx) = Arc::clone(engine)
            .execute_step(
                (**rollback).clone(),
                ctx.clone(),
                path,
                CancellationToken::new(),
                None,
            )
            .await;

        match result.status {
            StepStatus::Completed | StepStatus::Skipped => {
                engine.sink.emit(ProgressEvent::RollbackCompleted {
                    run_id: engine.run_id,
                    for_step: name.clone(),
                });
            }
            StepStatus::Failed | StepStatus::Cancelled => {
                let error = result
                    .error
                    .unwrap_or_else(|| "rollback did not complete".to_string());
                tracing::error!(
                    run_id = %engine.run_id,
                    step = name.as_str(),
                    error = error.as_str(),
                    "rollback step failed"
                );
                engine.sink.emit(ProgressEvent::RollbackError {
                    run_id: engine.run_id,
                    for_step: name.clone(),
                    error,
                });
            }
        }
    }
}

/// Steps whose results land in the top-level scope: top-level steps and
/// parallel children, recursively. Loop bodies are iteration-scoped and
/// excluded.
fn collect_top_scope_steps(steps: &[Step], map: &mut HashMap<String, Step>) {
    for step in steps {
        map.insert(step.name.clone(), step.clone());
        if let StepKind::Parallel { steps: children, .. } = &step.kind {
            collect_top_scope_steps(children, map);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::handler::{FnHandler, HandlerError, HandlerInvocation};
    use serde_json::json;

    fn action_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            when: None,
            retry: None,
            on_failure: None,
            rollback: None,
            kind: StepKind::Action {
                action: "echo".to_string(),
                args: serde_json::Map::new(),
            },
        }
    }

    fn definition(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test-wf".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            inputs: vec![],
            steps,
            outputs: BTreeMap::new(),
        }
    }

    /// Registry whose action handler records invocation order and echoes the
    /// step name.
    fn recording_registry(log: Arc<Mutex<Vec<String>>>) -> HandlerRegistry {
        HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(move |inv: HandlerInvocation| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(inv.step_name.clone());
                    Ok(json!(format!("out-{}", inv.step_name)))
                }
            }),
        )
    }

    async fn run_to_completion(
        orchestrator: &Orchestrator<MemoryCheckpointStore>,
        def: WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> (WorkflowResult, Vec<ProgressEvent>) {
        let mut handle = orchestrator.start(def, inputs);
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        (handle.join().await, events)
    }

    // -------------------------------------------------------------------
    // Event bounding: exactly one Started first, one Completed last
    // -------------------------------------------------------------------

    fn assert_bounded(events: &[ProgressEvent]) {
        assert!(matches!(
            events.first(),
            Some(ProgressEvent::WorkflowStarted { .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::WorkflowCompleted { .. })
        ));
        let started = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::WorkflowStarted { .. }))
            .count();
        let completed = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::WorkflowCompleted { .. }))
            .count();
        assert_eq!(started, 1);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_successful_run_bounded_events_and_outputs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator =
            Orchestrator::new(recording_registry(Arc::clone(&log)), MemoryCheckpointStore::new());

        let mut def = definition(vec![action_step("a"), action_step("b")]);
        def.outputs = BTreeMap::from([("last".to_string(), "steps.b.output".to_string())]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;

        assert!(result.success);
        assert_eq!(result.outputs["last"], json!("out-b"));
        assert_eq!(log.lock().unwrap().as_slice(), ["a", "b"]);
        assert_bounded(&events);

        // Every StepStarted pairs with exactly one terminal StepCompleted
        for name in ["a", "b"] {
            let started = events
                .iter()
                .filter(
                    |e| matches!(e, ProgressEvent::StepStarted { step_name, .. } if step_name == name),
                )
                .count();
            let completed = events
                .iter()
                .filter(
                    |e| matches!(e, ProgressEvent::StepCompleted { step_name, .. } if step_name == name),
                )
                .count();
            assert_eq!((started, completed), (1, 1), "step {name}");
        }
    }

    #[tokio::test]
    async fn test_validation_failure_still_bounded() {
        let orchestrator =
            Orchestrator::new(HandlerRegistry::new(), MemoryCheckpointStore::new());
        // Duplicate step names: fails validation, run never starts stepping
        let def = definition(vec![action_step("a"), action_step("a")]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("duplicate"));
        assert!(result.results.is_empty());
        assert_bounded(&events);
        // No step events at all
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProgressEvent::StepStarted { .. })));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_before_stepping() {
        let orchestrator =
            Orchestrator::new(HandlerRegistry::new(), MemoryCheckpointStore::new());
        let def = definition(vec![action_step("a")]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("action"));
        assert_bounded(&events);
    }

    #[tokio::test]
    async fn test_missing_required_input_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator =
            Orchestrator::new(recording_registry(Arc::clone(&log)), MemoryCheckpointStore::new());

        let mut def = definition(vec![action_step("a")]);
        def.inputs = vec![pipewright_types::workflow::InputSpec {
            name: "task".to_string(),
            ty: pipewright_types::workflow::InputType::String,
            required: true,
            default: None,
        }];

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("task"));
        assert!(log.lock().unwrap().is_empty());
        assert_bounded(&events);
    }

    #[tokio::test]
    async fn test_input_defaults_applied() {
        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(|inv: HandlerInvocation| async move {
                Ok(inv.payload["args"]["branch"].clone())
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let mut step = action_step("a");
        step.kind = StepKind::Action {
            action: "echo".to_string(),
            args: serde_json::Map::from_iter([(
                "branch".to_string(),
                json!("{{ inputs.base_branch }}"),
            )]),
        };
        let mut def = definition(vec![step]);
        def.inputs = vec![pipewright_types::workflow::InputSpec {
            name: "base_branch".to_string(),
            ty: pipewright_types::workflow::InputType::String,
            required: false,
            default: Some(json!("main")),
        }];
        def.outputs = BTreeMap::from([("branch".to_string(), "steps.a.output".to_string())]);

        let (result, _events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(result.success);
        assert_eq!(result.outputs["branch"], json!("main"));
    }

    // -------------------------------------------------------------------
    // Scenario A: when=false skips without handler invocation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_a_conditional_skip() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator =
            Orchestrator::new(recording_registry(Arc::clone(&log)), MemoryCheckpointStore::new());

        let mut skipped = action_step("b");
        skipped.when = Some("false".to_string());
        let def = definition(vec![action_step("a"), skipped]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;

        assert!(result.success);
        assert_eq!(log.lock().unwrap().as_slice(), ["a"]);
        let statuses: HashMap<String, StepStatus> = result
            .results
            .iter()
            .map(|r| (r.name.clone(), r.status))
            .collect();
        assert_eq!(statuses["a"], StepStatus::Completed);
        assert_eq!(statuses["b"], StepStatus::Skipped);
        // Skipped step emits no StepStarted
        assert!(!events.iter().any(
            |e| matches!(e, ProgressEvent::StepStarted { step_name, .. } if step_name == "b")
        ));
    }

    // -------------------------------------------------------------------
    // Scenario B: sequential loop over ["x","y","z"]
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_b_sequential_loop_ordered() {
        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(|inv: HandlerInvocation| async move {
                Ok(inv.context["item"].clone())
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let looped = Step {
            name: "letters".to_string(),
            when: None,
            retry: None,
            on_failure: None,
            rollback: None,
            kind: StepKind::Loop {
                items: "['x', 'y', 'z']".to_string(),
                item_var: None,
                body: vec![action_step("handle")],
                max_concurrency: None,
            },
        };
        let def = definition(vec![looped]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(result.success);

        let iterations: Vec<(usize, String)> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::LoopIterationStarted { index, label, .. } => {
                    Some((*index, label.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            iterations,
            vec![
                (0, "x".to_string()),
                (1, "y".to_string()),
                (2, "z".to_string())
            ]
        );

        let loop_result = result.results.iter().find(|r| r.name == "letters").unwrap();
        let output = loop_result.output.as_ref().unwrap();
        assert_eq!(output["items"], json!(3));
        assert_eq!(output["completed"], json!(3));
    }

    // -------------------------------------------------------------------
    // Loop accounting: completed+failed+skipped+cancelled == N
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_accounting_sums_to_item_count() {
        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(|inv: HandlerInvocation| async move {
                if inv.context["item"] == json!("bad") {
                    Err(HandlerError::Failed("broken item".to_string()))
                } else {
                    Ok(json!("ok"))
                }
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let looped = Step {
            name: "items".to_string(),
            when: None,
            retry: None,
            on_failure: None,
            rollback: None,
            kind: StepKind::Loop {
                items: "['a', 'bad', 'c', 'd']".to_string(),
                item_var: None,
                body: vec![action_step("handle")],
                max_concurrency: None,
            },
        };
        let def = definition(vec![looped]);

        let (result, _events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(!result.success);

        let loop_result = result.results.iter().find(|r| r.name == "items").unwrap();
        let output = loop_result.output.as_ref().unwrap();
        let total: u64 = ["completed", "failed", "skipped", "cancelled"]
            .iter()
            .map(|k| output[*k].as_u64().unwrap())
            .sum();
        assert_eq!(total, 4);
        assert_eq!(output["failed"], json!(1));
    }

    // -------------------------------------------------------------------
    // Scenario D: resume after step 2 of 4
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_d_resume_skips_completed_steps() {
        let store = Arc::new(MemoryCheckpointStore::new());

        // First run: step "c" fails after "a" and "b" completed
        let first_log = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&first_log);
        let failing_registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(move |inv: HandlerInvocation| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(inv.step_name.clone());
                    if inv.step_name == "c" {
                        Err(HandlerError::Failed("transient outage".to_string()))
                    } else {
                        Ok(json!(format!("out-{}", inv.step_name)))
                    }
                }
            }),
        );

        let def = definition(vec![
            action_step("a"),
            action_step("b"),
            action_step("c"),
            action_step("d"),
        ]);

        let orchestrator = Orchestrator::new(failing_registry, SharedStore(Arc::clone(&store)));
        let mut handle = orchestrator.start(def.clone(), BTreeMap::new());
        while handle.events.recv().await.is_some() {}
        let first = handle.join().await;
        assert!(!first.success);
        assert_eq!(first_log.lock().unwrap().as_slice(), ["a", "b", "c"]);
        let run_id = first.run_id;

        // Second run resumes from the checkpoint after "b" with a healthy
        // handler: a and b are NOT re-invoked
        let second_log = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&second_log);
        let healthy_registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(move |inv: HandlerInvocation| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(inv.step_name.clone());
                    Ok(json!(format!("out-{}", inv.step_name)))
                }
            }),
        );
        let orchestrator = Orchestrator::new(healthy_registry, SharedStore(store));
        let mut handle = orchestrator.resume(def, run_id);
        while handle.events.recv().await.is_some() {}
        let second = handle.join().await;

        assert!(second.success, "resumed run should succeed: {:?}", second.error);
        assert_eq!(second_log.lock().unwrap().as_slice(), ["c", "d"]);

        // The final result matches an uninterrupted run: all four steps
        // accounted for with their outputs
        let statuses: HashMap<String, StepStatus> = second
            .results
            .iter()
            .map(|r| (r.name.clone(), r.status))
            .collect();
        for name in ["a", "b", "c", "d"] {
            assert_eq!(statuses[name], StepStatus::Completed, "step {name}");
        }
    }

    /// Arc-wrapped store so two orchestrators can share one backing map.
    struct SharedStore(Arc<MemoryCheckpointStore>);

    impl CheckpointStore for SharedStore {
        async fn save(
            &self,
            state: &CheckpointState,
        ) -> Result<(), crate::checkpoint::CheckpointError> {
            self.0.save(state).await
        }

        async fn load(
            &self,
            run_id: Uuid,
        ) -> Result<Option<CheckpointState>, crate::checkpoint::CheckpointError> {
            self.0.load(run_id).await
        }

        async fn list(&self) -> Result<Vec<CheckpointState>, crate::checkpoint::CheckpointError> {
            self.0.list().await
        }

        async fn delete(&self, run_id: Uuid) -> Result<bool, crate::checkpoint::CheckpointError> {
            self.0.delete(run_id).await
        }
    }

    // -------------------------------------------------------------------
    // Scenario E: cancel mid-loop
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_e_cancel_mid_loop() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let started_tx = Arc::new(Mutex::new(None::<tokio::sync::oneshot::Sender<()>>));
        let (notify_started, started_rx) = tokio::sync::oneshot::channel::<()>();
        *started_tx.lock().unwrap() = Some(notify_started);

        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(move |inv: HandlerInvocation| {
                let release_rx = Arc::clone(&release_rx);
                let started_tx = Arc::clone(&started_tx);
                async move {
                    if inv.context["index"] == json!(0) {
                        // Signal that iteration 0 is in flight, then wait for
                        // the test to cancel the run before finishing
                        if let Some(tx) = started_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        let rx = release_rx.lock().unwrap().take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                    }
                    Ok(json!("done"))
                }
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let looped = Step {
            name: "work".to_string(),
            when: None,
            retry: None,
            on_failure: None,
            rollback: None,
            kind: StepKind::Loop {
                items: "['first', 'second', 'third']".to_string(),
                item_var: None,
                body: vec![action_step("handle")],
                max_concurrency: None,
            },
        };
        let def = definition(vec![looped, action_step("after")]);

        let mut handle = orchestrator.start(def, BTreeMap::new());
        let run_id = handle.run_id;

        // Wait until iteration 0 is actually executing, then cancel
        started_rx.await.unwrap();
        assert!(orchestrator.cancel(run_id));
        let _ = release_tx.send(());

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        let result = handle.join().await;

        assert!(!result.success);
        assert_bounded(&events);

        // Iteration 0 completed normally; 1 and 2 were cancelled
        let loop_result = result.results.iter().find(|r| r.name == "work").unwrap();
        let output = loop_result.output.as_ref().unwrap();
        assert_eq!(output["completed"], json!(1));
        assert_eq!(output["cancelled"], json!(2));

        // The following top-level step was cancelled, distinct from Skipped
        let after = result.results.iter().find(|r| r.name == "after").unwrap();
        assert_eq!(after.status, StepStatus::Cancelled);
    }

    // -------------------------------------------------------------------
    // Rollback: reverse completion order
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_rollback_reverse_completion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(move |inv: HandlerInvocation| {
                let log = Arc::clone(&log_clone);
                async move {
                    log.lock().unwrap().push(inv.step_name.clone());
                    if inv.step_name == "boom" {
                        Err(HandlerError::Failed("fatal".to_string()))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let mut first = action_step("create-branch");
        first.rollback = Some(Box::new(action_step("delete-branch")));
        let mut second = action_step("push-commit");
        second.rollback = Some(Box::new(action_step("revert-commit")));
        let def = definition(vec![first, second, action_step("boom")]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(!result.success);

        // Rollbacks run in reverse completion order
        let invocations = log.lock().unwrap().clone();
        assert_eq!(
            invocations,
            [
                "create-branch",
                "push-commit",
                "boom",
                "revert-commit",
                "delete-branch"
            ]
        );

        let rollback_events: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::RollbackStarted { for_step, .. } => Some(for_step.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(rollback_events, ["push-commit", "create-branch"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::RollbackCompleted { .. })));
    }

    #[tokio::test]
    async fn test_skipped_steps_never_roll_back() {
        let registry = HandlerRegistry::new().with(
            HandlerKind::Action,
            FnHandler::new(|inv: HandlerInvocation| async move {
                if inv.step_name == "boom" {
                    Err(HandlerError::Failed("fatal".to_string()))
                } else {
                    Ok(json!("ok"))
                }
            }),
        );
        let orchestrator = Orchestrator::new(registry, MemoryCheckpointStore::new());

        let mut skipped = action_step("optional");
        skipped.when = Some("false".to_string());
        skipped.rollback = Some(Box::new(action_step("undo-optional")));
        let def = definition(vec![skipped, action_step("boom")]);

        let (_result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProgressEvent::RollbackStarted { .. })));
    }

    // -------------------------------------------------------------------
    // Failed output computation fails the run
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_auto_checkpoints_saved_after_each_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator =
            Orchestrator::new(recording_registry(log), MemoryCheckpointStore::new());
        let def = definition(vec![action_step("a"), action_step("b")]);

        let (result, events) = run_to_completion(&orchestrator, def, BTreeMap::new()).await;
        assert!(result.success);

        let saved = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::CheckpointSaved { label: None, .. }))
            .count();
        assert_eq!(saved, 2);

        let states = orchestrator.checkpoints().store().list().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].cursor, vec![CursorFrame::new("", 2)]);
        assert_eq!(states[0].results.len(), 2);
    }
}
