//! Checkpoint store port and the checkpoint manager.
//!
//! The engine persists run state through an injected [`CheckpointStore`]
//! collaborator (file, key-value store -- medium-agnostic). The
//! [`CheckpointManager`] layers the engine's two save policies on top:
//! automatic after-step checkpoints are best-effort (a store failure degrades
//! to a logged warning), while an explicit `checkpoint` step treats a store
//! failure as fatal, since persistence is its sole purpose.

use std::future::Future;

use dashmap::DashMap;
use pipewright_types::checkpoint::CheckpointState;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Store(String),

    /// No checkpoint exists for the run (resume).
    #[error("no checkpoint found for run {0}")]
    NotFound(Uuid),

    /// The checkpoint was produced by a different definition version.
    #[error("checkpoint for run {run_id} was saved with version {saved}, definition is {current}")]
    VersionMismatch {
        run_id: Uuid,
        saved: String,
        current: String,
    },
}

// ---------------------------------------------------------------------------
// CheckpointStore port
// ---------------------------------------------------------------------------

/// Storage interface for checkpoint state.
///
/// The store is the only engine collaborator requiring external
/// synchronization; implementations must be safe to call from concurrent
/// runs.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous state for the run.
    fn save(
        &self,
        state: &CheckpointState,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Load the latest checkpoint for a run.
    fn load(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Option<CheckpointState>, CheckpointError>> + Send;

    /// List all stored checkpoints.
    fn list(&self) -> impl Future<Output = Result<Vec<CheckpointState>, CheckpointError>> + Send;

    /// Delete a run's checkpoint. Returns `true` if one existed.
    fn delete(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<bool, CheckpointError>> + Send;
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Applies the engine's save policies on top of a [`CheckpointStore`].
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Best-effort automatic checkpoint after a top-level step.
    ///
    /// Returns `true` when the state was persisted. A store failure is
    /// logged and swallowed -- the run continues.
    pub async fn save_auto(&self, state: &CheckpointState) -> bool {
        match self.store.save(state).await {
            Ok(()) => {
                tracing::debug!(
                    run_id = %state.run_id,
                    cursor = ?state.cursor,
                    "automatic checkpoint saved"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    %err,
                    "automatic checkpoint failed, continuing without it"
                );
                false
            }
        }
    }

    /// Persist an explicit `checkpoint` step's state. Failure is fatal for
    /// that step.
    pub async fn save_explicit(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        self.store.save(state).await?;
        tracing::debug!(
            run_id = %state.run_id,
            label = state.label.as_deref().unwrap_or(""),
            "explicit checkpoint saved"
        );
        Ok(())
    }

    /// Load a checkpoint for resumption, refusing version mismatches.
    pub async fn load_for_resume(
        &self,
        run_id: Uuid,
        expected_version: &str,
    ) -> Result<CheckpointState, CheckpointError> {
        let state = self
            .store
            .load(run_id)
            .await?
            .ok_or(CheckpointError::NotFound(run_id))?;
        if state.workflow_version != expected_version {
            return Err(CheckpointError::VersionMismatch {
                run_id,
                saved: state.workflow_version,
                current: expected_version.to_string(),
            });
        }
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    states: DashMap<Uuid, CheckpointState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        self.states.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<CheckpointState>, CheckpointError> {
        Ok(self.states.get(&run_id).map(|entry| entry.clone()))
    }

    async fn list(&self) -> Result<Vec<CheckpointState>, CheckpointError> {
        let mut states: Vec<CheckpointState> =
            self.states.iter().map(|entry| entry.clone()).collect();
        states.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));
        Ok(states)
    }

    async fn delete(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        Ok(self.states.remove(&run_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
