//! Parallel group execution: a fixed set of sibling steps run concurrently.
//!
//! Children are dispatched into a `JoinSet`, optionally capped by a
//! semaphore. Each child runs on a snapshot of the group's context; completed
//! children's outputs merge back at the join (sibling-name uniqueness makes
//! the merge conflict-free). The group fails fast: the first child failure
//! cancels siblings that have not started yet, but every child is still
//! accounted for -- cancelled children get a terminal Cancelled result.

use std::collections::BTreeMap;
use std::sync::Arc;

use pipewright_types::workflow::{Step, StepResult, StepStatus};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::context::WorkflowContext;
use crate::dispatcher::{RunEngine, ScopePath, StepOutcome};

impl<S: CheckpointStore + Send + Sync + 'static> RunEngine<S> {
    pub(crate) async fn run_parallel(
        self: Arc<Self>,
        group_name: &str,
        children: Vec<Step>,
        max_concurrency: Option<usize>,
        ctx: &mut WorkflowContext,
        path: &ScopePath,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let group_token = cancel.child_token();
        let semaphore = max_concurrency.map(|cap| Arc::new(Semaphore::new(cap)));
        let mut join_set = JoinSet::new();

        for child in children {
            let engine = Arc::clone(&self);
            let snapshot = ctx.clone();
            // Children execute in the group's enclosing scope; their outputs
            // belong to the same context the group itself writes to.
            let child_path = path.clone();
            let token = group_token.clone();
            let semaphore = semaphore.clone();
            let scope = path.result_scope();

            join_set.spawn(async move {
                if let Some(semaphore) = semaphore {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        let result =
                            StepResult::unstarted(&child.name, StepStatus::Cancelled, &scope);
                        engine.record_result(&result);
                        return (result, None);
                    };
                    // Permit held for the child's whole execution
                    if token.is_cancelled() {
                        let result =
                            StepResult::unstarted(&child.name, StepStatus::Cancelled, &scope);
                        engine.record_result(&result);
                        return (result, None);
                    }
                    let (result, child_ctx) = engine
                        .execute_step(child, snapshot, child_path, token, None)
                        .await;
                    (result, Some(child_ctx))
                } else {
                    let (result, child_ctx) = engine
                        .execute_step(child, snapshot, child_path, token, None)
                        .await;
                    (result, Some(child_ctx))
                }
            });
        }

        let mut child_statuses: BTreeMap<String, StepStatus> = BTreeMap::new();
        let mut first_error: Option<String> = None;
        let mut join_failure = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((result, child_ctx)) => {
                    if result.status == StepStatus::Failed {
                        // Fail fast: siblings that have not started observe
                        // the cancelled token and settle as Cancelled.
                        group_token.cancel();
                        if first_error.is_none() {
                            first_error = Some(format!(
                                "child '{}' failed: {}",
                                result.name,
                                result.error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                    }
                    if result.status == StepStatus::Completed {
                        if let Some(child_ctx) = &child_ctx {
                            if let Err(err) = ctx.merge_outputs_from(child_ctx) {
                                tracing::error!(%err, "failed to merge parallel child outputs");
                                first_error.get_or_insert_with(|| err.to_string());
                                join_failure = true;
                            }
                        }
                    }
                    child_statuses.insert(result.name.clone(), result.status);
                }
                Err(err) => {
                    tracing::error!(%err, "parallel child task failed to join");
                    group_token.cancel();
                    first_error.get_or_insert_with(|| format!("child task join error: {err}"));
                    join_failure = true;
                }
            }
        }

        let any_failed =
            join_failure || child_statuses.values().any(|s| *s == StepStatus::Failed);
        let any_cancelled = child_statuses.values().any(|s| *s == StepStatus::Cancelled);

        let output = json!({
            "children": child_statuses
                .iter()
                .map(|(name, status)| (name.clone(), json!(status)))
                .collect::<serde_json::Map<_, _>>(),
        });

        if any_failed {
            let mut outcome = StepOutcome::failed(
                first_error
                    .unwrap_or_else(|| format!("parallel group '{group_name}' failed")),
                1,
            );
            outcome.output = Some(output);
            outcome
        } else if any_cancelled {
            let mut outcome = StepOutcome::cancelled(1);
            outcome.output = Some(output);
            outcome
        } else {
            StepOutcome::completed(output, 1)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
