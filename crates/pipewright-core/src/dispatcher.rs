//! Per-step dispatch: conditional skip, handler invocation, retry/backoff,
//! failure fallback, and native step kinds.
//!
//! `RunEngine` is the per-run execution state shared by the dispatcher, the
//! loop runner, and the parallel group runner. `execute_step` drives one step
//! to exactly one terminal status:
//!
//! 1. `when` false -> `StepCompleted(Skipped)`, no handler, no retry.
//! 2. Native kinds (`parallel`, `loop`, `checkpoint`) run in-engine;
//!    everything else goes through the injected handler registry.
//! 3. Handler failures retry up to `max_attempts` with the configured
//!    backoff; attempts are not assumed idempotent.
//! 4. After exhausting attempts, an `on_failure` step (if any) is dispatched;
//!    its completion recovers the step, its failure is terminal.
//!
//! Handler errors and panics never escape this layer -- they become failed
//! step results.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use pipewright_types::checkpoint::{CheckpointState, CursorFrame};
use pipewright_types::event::ProgressEvent;
use pipewright_types::workflow::{
    Backoff, RetryPolicy, Step, StepKind, StepResult, StepStatus, WorkflowDefinition,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::context::WorkflowContext;
use crate::events::EventSink;
use crate::expression::{Evaluator, ExpressionError};
use crate::handler::{HandlerInvocation, HandlerKind, HandlerRegistry};

// ---------------------------------------------------------------------------
// ScopePath
// ---------------------------------------------------------------------------

/// The nested position of a step being dispatched: one cursor frame per
/// nesting level, the last frame holding the step's index in its own scope.
#[derive(Debug, Clone)]
pub(crate) struct ScopePath {
    pub frames: Vec<CursorFrame>,
}

impl ScopePath {
    /// Path of a top-level step.
    pub fn root(index: usize) -> Self {
        Self {
            frames: vec![CursorFrame::new("", index)],
        }
    }

    /// Descend into a nested scope.
    pub fn push(&self, scope: impl Into<String>, index: usize) -> Self {
        let mut frames = self.frames.clone();
        frames.push(CursorFrame::new(scope, index));
        Self { frames }
    }

    /// Cursor that resumes execution after this position.
    pub fn advanced(&self) -> Vec<CursorFrame> {
        let mut frames = self.frames.clone();
        if let Some(last) = frames.last_mut() {
            last.index += 1;
        }
        frames
    }

    /// The context scope a result at this path belongs to (`""` at top level,
    /// `"deploy[2]"` inside iteration 2 of loop `deploy`, joined with `/`
    /// when nested).
    pub fn result_scope(&self) -> String {
        let parts: Vec<String> = self
            .frames
            .iter()
            .filter(|f| !f.scope.is_empty() && !f.scope.ends_with(".body"))
            .map(|f| format!("{}[{}]", f.scope, f.index))
            .collect();
        parts.join("/")
    }

    /// Name of the innermost enclosing loop, if any.
    pub fn enclosing_loop(&self) -> Option<String> {
        self.frames
            .iter()
            .rev()
            .find(|f| !f.scope.is_empty() && !f.scope.ends_with(".body"))
            .map(|f| f.scope.clone())
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Intermediate outcome of a step body, before the terminal result is built.
#[derive(Debug)]
pub(crate) struct StepOutcome {
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl StepOutcome {
    pub fn completed(output: Value, attempts: u32) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
        }
    }

    pub fn failed(error: String, attempts: u32) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
        }
    }

    pub fn cancelled(attempts: u32) -> Self {
        Self {
            status: StepStatus::Cancelled,
            output: None,
            error: None,
            attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// RunEngine
// ---------------------------------------------------------------------------

/// Shared per-run execution state.
pub(crate) struct RunEngine<S: CheckpointStore> {
    pub definition: Arc<WorkflowDefinition>,
    pub run_id: Uuid,
    pub inputs: BTreeMap<String, Value>,
    pub handlers: Arc<HandlerRegistry>,
    pub evaluator: Evaluator,
    pub sink: EventSink,
    pub checkpoints: Arc<CheckpointManager<S>>,
    /// Terminal step results in completion order (all scopes).
    pub results: Mutex<Vec<StepResult>>,
    /// Checkpoint this run was resumed from, if any.
    pub resume_state: Option<Arc<CheckpointState>>,
}

impl<S: CheckpointStore + Send + Sync + 'static> RunEngine<S> {
    /// Record a terminal result and emit its `StepCompleted` event.
    pub fn record_result(&self, result: &StepResult) {
        self.sink.emit(ProgressEvent::StepCompleted {
            run_id: self.run_id,
            step_name: result.name.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });
        self.results
            .lock()
            .expect("results mutex poisoned")
            .push(result.clone());
    }

    /// Snapshot the run into a checkpoint state.
    pub fn checkpoint_state(
        &self,
        label: Option<String>,
        cursor: Vec<CursorFrame>,
    ) -> CheckpointState {
        let results = self
            .results
            .lock()
            .expect("results mutex poisoned")
            .clone();
        CheckpointState {
            workflow_name: self.definition.name.clone(),
            workflow_version: self.definition.version.clone(),
            run_id: self.run_id,
            inputs: self.inputs.clone(),
            results,
            cursor,
            label,
            saved_at: Utc::now(),
        }
    }

    /// Drive one step to its terminal status.
    ///
    /// Returns the step's result together with the (possibly mutated)
    /// context. Boxed for recursion: loops and parallel groups dispatch their
    /// body steps through this same entry point.
    pub fn execute_step(
        self: Arc<Self>,
        step: Step,
        mut ctx: WorkflowContext,
        path: ScopePath,
        cancel: CancellationToken,
        resume: Option<Vec<CursorFrame>>,
    ) -> BoxFuture<'static, (StepResult, WorkflowContext)> {
        Box::pin(async move {
            let scope = path.result_scope();

            // Cancellation is checked at step boundaries; work not yet
            // started is marked Cancelled, never retried or rolled back.
            if cancel.is_cancelled() {
                let result = StepResult::unstarted(&step.name, StepStatus::Cancelled, &scope);
                self.record_result(&result);
                return (result, ctx);
            }

            // `when` defaults to true. False skips the step entirely.
            let when_verdict = step
                .when
                .as_ref()
                .map(|when| self.evaluator.evaluate_bool(when, &ctx.to_expression_context()));
            if let Some(Ok(false)) = &when_verdict {
                tracing::debug!(step = step.name.as_str(), "condition false, skipping");
                let result = StepResult::unstarted(&step.name, StepStatus::Skipped, &scope);
                self.record_result(&result);
                return (result, ctx);
            }

            self.sink.emit(ProgressEvent::StepStarted {
                run_id: self.run_id,
                step_name: step.name.clone(),
                step_type: step.kind_name().to_string(),
            });
            let started = Instant::now();

            let mut outcome = match when_verdict {
                // A broken condition is an authoring error: fail immediately,
                // no retry.
                Some(Err(err)) => StepOutcome::failed(err.to_string(), 0),
                _ => match step.kind.clone() {
                    StepKind::Parallel {
                        steps: children,
                        max_concurrency,
                    } => {
                        Arc::clone(&self)
                            .run_parallel(&step.name, children, max_concurrency, &mut ctx, &path, &cancel)
                            .await
                    }
                    StepKind::Loop {
                        items,
                        item_var,
                        body,
                        max_concurrency,
                    } => {
                        Arc::clone(&self)
                            .run_loop(
                                &step.name,
                                &items,
                                item_var,
                                body,
                                max_concurrency,
                                &mut ctx,
                                &path,
                                &cancel,
                                resume,
                            )
                            .await
                    }
                    StepKind::Checkpoint { label } => self.run_checkpoint(&label, &path).await,
                    other => self.run_handler_step(&step, other, &ctx, &cancel).await,
                },
            };

            // Failure fallback: dispatch on_failure once attempts are
            // exhausted. Its completion recovers the step; its failure is
            // terminal. Skipped/Cancelled outcomes never reach this point
            // with a fallback dispatch.
            if outcome.status == StepStatus::Failed {
                if let Some(fallback) = &step.on_failure {
                    tracing::warn!(
                        step = step.name.as_str(),
                        fallback = fallback.name.as_str(),
                        error = outcome.error.as_deref().unwrap_or(""),
                        "step failed, dispatching on_failure fallback"
                    );
                    let (fallback_result, fallback_ctx) = Arc::clone(&self)
                        .execute_step(
                            (**fallback).clone(),
                            ctx,
                            path.clone(),
                            cancel.clone(),
                            None,
                        )
                        .await;
                    ctx = fallback_ctx;
                    match fallback_result.status {
                        StepStatus::Completed => {
                            outcome = StepOutcome {
                                status: StepStatus::Completed,
                                output: fallback_result.output,
                                error: None,
                                attempts: outcome.attempts,
                            };
                        }
                        StepStatus::Cancelled => outcome.status = StepStatus::Cancelled,
                        // A failed or skipped fallback leaves the original
                        // failure in place.
                        StepStatus::Failed | StepStatus::Skipped => {}
                    }
                }
            }

            // Record the output (write-once; a duplicate is an engine bug).
            if outcome.status == StepStatus::Completed {
                if let Some(output) = outcome.output.clone() {
                    if let Err(err) = ctx.set_step_output(&step.name, output) {
                        outcome = StepOutcome::failed(err.to_string(), outcome.attempts);
                    }
                }
            }

            let result = StepResult {
                name: step.name.clone(),
                status: outcome.status,
                output: outcome.output,
                error: outcome.error,
                duration_ms: started.elapsed().as_millis() as u64,
                attempts: outcome.attempts,
                scope,
            };
            self.record_result(&result);
            (result, ctx)
        })
    }

    // -----------------------------------------------------------------------
    // Handler-backed steps
    // -----------------------------------------------------------------------

    /// Invoke the registered handler with retry/backoff.
    async fn run_handler_step(
        &self,
        step: &Step,
        kind: StepKind,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let Some(handler_kind) = HandlerKind::for_step(&kind) else {
            return StepOutcome::failed(
                format!("engine-native step '{}' reached handler dispatch", step.name),
                0,
            );
        };
        let Some(handler) = self.handlers.get(handler_kind) else {
            return StepOutcome::failed(
                format!("no handler registered for step type '{handler_kind}'"),
                0,
            );
        };

        let validate_stages = match &kind {
            StepKind::Validate { stages } => Some(stages.clone()),
            _ => None,
        };

        let expr_ctx = ctx.to_expression_context();
        // Template resolution failures are authoring errors: no retry.
        let payload = match self.build_payload(&kind, &expr_ctx) {
            Ok(payload) => payload,
            Err(err) => return StepOutcome::failed(err.to_string(), 0),
        };

        if let Some(stages) = &validate_stages {
            self.sink.emit(ProgressEvent::ValidationStarted {
                run_id: self.run_id,
                step_name: step.name.clone(),
                stages: stages.clone(),
            });
        }

        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
        let mut attempts_made = 0;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            attempts_made = attempt;
            let invocation = HandlerInvocation {
                run_id: self.run_id,
                workflow_name: self.definition.name.clone(),
                step_name: step.name.clone(),
                kind: handler_kind,
                payload: payload.clone(),
                context: expr_ctx.clone(),
                attempt,
            };

            // Panics are contained here: a panicking handler becomes a
            // failed attempt, subject to the same retry policy.
            let attempt_result = AssertUnwindSafe(handler.handle(invocation))
                .catch_unwind()
                .await;

            match attempt_result {
                Ok(Ok(output)) => {
                    if validate_stages.is_some() {
                        self.sink.emit(ProgressEvent::ValidationCompleted {
                            run_id: self.run_id,
                            step_name: step.name.clone(),
                        });
                    }
                    return StepOutcome::completed(output, attempt);
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(panic) => last_error = format!("handler panicked: {}", panic_message(panic)),
            }

            tracing::warn!(
                step = step.name.as_str(),
                attempt,
                max_attempts,
                error = last_error.as_str(),
                "step attempt failed"
            );

            if attempt < max_attempts {
                let delay = backoff_delay(step.retry.as_ref(), attempt);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        if validate_stages.is_some() {
            self.sink.emit(ProgressEvent::ValidationFailed {
                run_id: self.run_id,
                step_name: step.name.clone(),
                error: last_error.clone(),
            });
        }

        StepOutcome::failed(last_error, attempts_made)
    }

    /// Build the kind-specific handler payload with templates resolved.
    fn build_payload(&self, kind: &StepKind, expr_ctx: &Value) -> Result<Value, ExpressionError> {
        match kind {
            StepKind::Action { action, args } => {
                let args = self
                    .evaluator
                    .render_value(&Value::Object(args.clone()), expr_ctx)?;
                Ok(json!({ "action": action, "args": args }))
            }
            StepKind::AgentCall {
                capability,
                context,
            } => {
                let context = self
                    .evaluator
                    .render_value(&Value::Object(context.clone()), expr_ctx)?;
                Ok(json!({ "capability": capability, "context": context }))
            }
            StepKind::TextGenerate { generator, context } => {
                let context = self
                    .evaluator
                    .render_value(&Value::Object(context.clone()), expr_ctx)?;
                Ok(json!({ "generator": generator, "context": context }))
            }
            StepKind::Validate { stages } => {
                let mut rendered = Vec::with_capacity(stages.len());
                for stage in stages {
                    rendered.push(self.evaluator.render_template(stage, expr_ctx)?);
                }
                Ok(json!({ "stages": rendered }))
            }
            StepKind::Subworkflow { workflow, inputs } => {
                // Input mapping values are full expressions, not templates.
                let mut resolved = serde_json::Map::with_capacity(inputs.len());
                for (name, expr_str) in inputs {
                    resolved.insert(name.clone(), self.evaluator.evaluate(expr_str, expr_ctx)?);
                }
                Ok(json!({ "workflow": workflow, "inputs": resolved }))
            }
            StepKind::Parallel { .. } | StepKind::Loop { .. } | StepKind::Checkpoint { .. } => {
                Ok(Value::Null)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Explicit checkpoint step
    // -----------------------------------------------------------------------

    /// Persist an explicit checkpoint. A store failure fails this step --
    /// persistence is its sole purpose.
    async fn run_checkpoint(&self, label: &str, path: &ScopePath) -> StepOutcome {
        let state = self.checkpoint_state(Some(label.to_string()), path.advanced());
        let recorded = state.results.len();
        match self.checkpoints.save_explicit(&state).await {
            Ok(()) => {
                self.sink.emit(ProgressEvent::CheckpointSaved {
                    run_id: self.run_id,
                    label: Some(label.to_string()),
                });
                StepOutcome::completed(
                    json!({ "label": label, "steps_recorded": recorded }),
                    1,
                )
            }
            Err(err) => StepOutcome::failed(err.to_string(), 1),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Delay before the attempt following `attempt` (1-based).
fn backoff_delay(retry: Option<&RetryPolicy>, attempt: u32) -> Duration {
    match retry.map(|r| r.backoff) {
        Some(Backoff::Exponential { base_delay_ms }) => {
            // base * 2^(attempt-1), saturating on pathological configs
            let factor = 1u64 << (attempt - 1).min(16);
            Duration::from_millis(base_delay_ms.saturating_mul(factor))
        }
        Some(Backoff::None) | None => Duration::ZERO,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
