//! Loop step execution: sequential and bounded-concurrency iteration.
//!
//! The items expression is evaluated exactly once at loop entry, fixing the
//! iteration count. Each iteration runs the body steps on a snapshot of the
//! parent context with a pushed loop frame; body outputs are iteration-scoped
//! and never leak into the enclosing scope -- the loop step's own output is a
//! per-iteration summary.
//!
//! Bounded mode launches up to `max_concurrency` iterations through a
//! `JoinSet` capped by a semaphore. Completion order may differ from start
//! order; every iteration's events carry its fixed index. On resume from a
//! mid-loop checkpoint, iterations strictly before the resume index are
//! marked Skipped without re-invoking their bodies.

use std::sync::Arc;

use pipewright_types::checkpoint::CursorFrame;
use pipewright_types::event::ProgressEvent;
use pipewright_types::workflow::{Step, StepStatus};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::context::WorkflowContext;
use crate::dispatcher::{RunEngine, ScopePath, StepOutcome};

// ---------------------------------------------------------------------------
// Iteration summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct IterationSummary {
    index: usize,
    label: String,
    status: StepStatus,
}

/// Display label for one iteration, derived from the item.
///
/// Observability metadata only -- never used in execution logic.
fn iteration_label(item: &Value, index: usize) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["label", "name", "title"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(String::from)
            .unwrap_or_else(|| format!("Item {index}")),
        _ => format!("Item {index}"),
    }
}

// ---------------------------------------------------------------------------
// Loop runner
// ---------------------------------------------------------------------------

impl<S: CheckpointStore + Send + Sync + 'static> RunEngine<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_loop(
        self: Arc<Self>,
        loop_name: &str,
        items_expr: &str,
        item_var: Option<String>,
        body: Vec<Step>,
        max_concurrency: Option<usize>,
        ctx: &mut WorkflowContext,
        path: &ScopePath,
        cancel: &CancellationToken,
        resume: Option<Vec<CursorFrame>>,
    ) -> StepOutcome {
        // The item sequence is fixed at loop entry: evaluated exactly once.
        let items_value = match self
            .evaluator
            .evaluate(items_expr, &ctx.to_expression_context())
        {
            Ok(value) => value,
            Err(err) => return StepOutcome::failed(err.to_string(), 0),
        };
        let Value::Array(items) = items_value else {
            return StepOutcome::failed(
                format!("loop '{loop_name}' items expression did not evaluate to an array"),
                0,
            );
        };

        let total = items.len();
        let var = item_var.unwrap_or_else(|| "item".to_string());
        let parent_loop = path.enclosing_loop();

        // Resume cursor: first frame names this loop and carries the
        // iteration to continue from; deeper frames position within its body.
        let (resume_iter, resume_inner) = match resume {
            Some(frames) if frames.first().is_some_and(|f| f.scope == loop_name) => {
                let iteration = frames[0].index;
                let inner = (frames.len() > 1).then(|| frames[1..].to_vec());
                (iteration, inner)
            }
            _ => (0, None),
        };

        let summaries = if max_concurrency.is_none_or(|c| c <= 1) {
            Arc::clone(&self)
                .run_sequential(
                loop_name,
                &items,
                &var,
                &body,
                ctx,
                path,
                cancel,
                resume_iter,
                resume_inner,
                parent_loop.clone(),
            )
            .await
        } else {
            Arc::clone(&self)
                .run_bounded(
                loop_name,
                items,
                &var,
                &body,
                ctx,
                path,
                cancel,
                max_concurrency.unwrap_or(1),
                resume_iter,
                resume_inner,
                parent_loop.clone(),
            )
            .await
        };

        summarize(loop_name, total, summaries)
    }

    /// Sequential mode: iteration i completes before i+1 starts.
    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        self: Arc<Self>,
        loop_name: &str,
        items: &[Value],
        var: &str,
        body: &[Step],
        ctx: &WorkflowContext,
        path: &ScopePath,
        cancel: &CancellationToken,
        resume_iter: usize,
        resume_inner: Option<Vec<CursorFrame>>,
        parent_loop: Option<String>,
    ) -> Vec<IterationSummary> {
        let mut summaries = Vec::with_capacity(items.len());
        let mut halted = false;

        for (index, item) in items.iter().enumerate() {
            let label = iteration_label(item, index);

            if index < resume_iter {
                // Already completed before the checkpoint
                summaries.push(IterationSummary {
                    index,
                    label,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            if halted || cancel.is_cancelled() {
                summaries.push(IterationSummary {
                    index,
                    label,
                    status: StepStatus::Cancelled,
                });
                continue;
            }

            self.sink.emit(ProgressEvent::LoopIterationStarted {
                run_id: self.run_id,
                loop_name: loop_name.to_string(),
                index,
                label: label.clone(),
                parent_loop: parent_loop.clone(),
            });

            let inner = (index == resume_iter).then(|| resume_inner.clone()).flatten();
            let status = Arc::clone(&self)
                .run_iteration(
                    loop_name,
                    ctx.clone(),
                    body,
                    var,
                    item.clone(),
                    index,
                    path,
                    cancel.clone(),
                    inner,
                )
                .await;

            self.sink.emit(ProgressEvent::LoopIterationCompleted {
                run_id: self.run_id,
                loop_name: loop_name.to_string(),
                index,
                status,
                parent_loop: parent_loop.clone(),
            });

            if matches!(status, StepStatus::Failed | StepStatus::Cancelled) {
                halted = true;
            }
            summaries.push(IterationSummary {
                index,
                label,
                status,
            });
        }

        summaries
    }

    /// Bounded-concurrency mode: a semaphore caps in-flight iterations.
    #[allow(clippy::too_many_arguments)]
    async fn run_bounded(
        self: Arc<Self>,
        loop_name: &str,
        items: Vec<Value>,
        var: &str,
        body: &[Step],
        ctx: &WorkflowContext,
        path: &ScopePath,
        cancel: &CancellationToken,
        max_concurrency: usize,
        resume_iter: usize,
        _resume_inner: Option<Vec<CursorFrame>>,
        parent_loop: Option<String>,
    ) -> Vec<IterationSummary> {
        // First iteration failure cancels iterations that have not started;
        // in-flight ones run to completion.
        let loop_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut join_set = JoinSet::new();
        let mut summaries = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let label = iteration_label(&item, index);

            if index < resume_iter {
                summaries.push(IterationSummary {
                    index,
                    label,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            let engine = Arc::clone(&self);
            let base_ctx = ctx.clone();
            let body = body.to_vec();
            let var = var.to_string();
            let loop_name = loop_name.to_string();
            let path = path.clone();
            let token = loop_token.clone();
            let semaphore = Arc::clone(&semaphore);
            let parent_loop = parent_loop.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return IterationSummary {
                        index,
                        label,
                        status: StepStatus::Cancelled,
                    };
                };
                if token.is_cancelled() {
                    return IterationSummary {
                        index,
                        label,
                        status: StepStatus::Cancelled,
                    };
                }

                engine.sink.emit(ProgressEvent::LoopIterationStarted {
                    run_id: engine.run_id,
                    loop_name: loop_name.clone(),
                    index,
                    label: label.clone(),
                    parent_loop: parent_loop.clone(),
                });

                // Mid-iteration resume positioning is sequential-only; a
                // resumed bounded iteration restarts from its first body step.
                let status = Arc::clone(&engine)
                    .run_iteration(
                        &loop_name,
                        base_ctx,
                        &body,
                        &var,
                        item,
                        index,
                        &path,
                        token.clone(),
                        None,
                    )
                    .await;

                engine.sink.emit(ProgressEvent::LoopIterationCompleted {
                    run_id: engine.run_id,
                    loop_name,
                    index,
                    status,
                    parent_loop,
                });

                IterationSummary {
                    index,
                    label,
                    status,
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(summary) => {
                    if summary.status == StepStatus::Failed {
                        loop_token.cancel();
                    }
                    summaries.push(summary);
                }
                Err(err) => {
                    tracing::error!(%err, "loop iteration task failed to join");
                    loop_token.cancel();
                    summaries.push(IterationSummary {
                        index: usize::MAX,
                        label: String::new(),
                        status: StepStatus::Failed,
                    });
                }
            }
        }

        summaries.sort_by_key(|s| s.index);
        summaries
    }

    /// Run one iteration's body steps sequentially on an iteration context.
    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        self: Arc<Self>,
        loop_name: &str,
        mut ctx: WorkflowContext,
        body: &[Step],
        var: &str,
        item: Value,
        index: usize,
        path: &ScopePath,
        cancel: CancellationToken,
        resume_inner: Option<Vec<CursorFrame>>,
    ) -> StepStatus {
        ctx.push_loop_frame(var.to_string(), item, index);
        let iter_path = path.push(loop_name, index);
        let body_scope = format!("{loop_name}.body");

        // Position within the body when resuming the interrupted iteration
        let (body_start, deeper) = match resume_inner {
            Some(frames) if frames.first().is_some_and(|f| f.scope == body_scope) => {
                let start = frames[0].index;
                let inner = (frames.len() > 1).then(|| frames[1..].to_vec());
                (start, inner)
            }
            _ => (0, None),
        };

        // Rehydrate body outputs produced before the checkpoint
        if body_start > 0 {
            if let Some(state) = &self.resume_state {
                let scope = iter_path.result_scope();
                for (name, output) in state.outputs_for_scope(&scope) {
                    if let Err(err) = ctx.set_step_output(name, output.clone()) {
                        tracing::warn!(%err, "failed to rehydrate iteration output");
                    }
                }
            }
        }

        for (position, step) in body.iter().enumerate() {
            if position < body_start {
                continue;
            }
            if cancel.is_cancelled() {
                return StepStatus::Cancelled;
            }

            let step_path = iter_path.push(body_scope.clone(), position);
            let resume = (position == body_start).then(|| deeper.clone()).flatten();
            let (result, next_ctx) = Arc::clone(&self)
                .execute_step(step.clone(), ctx, step_path, cancel.clone(), resume)
                .await;
            ctx = next_ctx;

            match result.status {
                StepStatus::Failed => return StepStatus::Failed,
                StepStatus::Cancelled => return StepStatus::Cancelled,
                StepStatus::Completed | StepStatus::Skipped => {}
            }
        }

        StepStatus::Completed
    }
}

/// Fold iteration summaries into the loop step's outcome.
fn summarize(loop_name: &str, total: usize, summaries: Vec<IterationSummary>) -> StepOutcome {
    let count = |status: StepStatus| summaries.iter().filter(|s| s.status == status).count();
    let completed = count(StepStatus::Completed);
    let failed = count(StepStatus::Failed);
    let skipped = count(StepStatus::Skipped);
    let cancelled = count(StepStatus::Cancelled);

    let iterations: Vec<Value> = summaries
        .iter()
        .filter(|s| s.index != usize::MAX)
        .map(|s| {
            json!({
                "index": s.index,
                "label": s.label,
                "status": s.status,
            })
        })
        .collect();

    let output = json!({
        "items": total,
        "completed": completed,
        "failed": failed,
        "skipped": skipped,
        "cancelled": cancelled,
        "iterations": iterations,
    });

    if failed > 0 {
        let mut outcome = StepOutcome::failed(
            format!("{failed} of {total} iterations of loop '{loop_name}' failed"),
            1,
        );
        outcome.output = Some(output);
        outcome
    } else if cancelled > 0 {
        let mut outcome = StepOutcome::cancelled(1);
        outcome.output = Some(output);
        outcome
    } else {
        StepOutcome::completed(output, 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
