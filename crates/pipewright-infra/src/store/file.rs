//! Filesystem-backed checkpoint store.
//!
//! One pretty-printed JSON file per run under `{dir}/<run_id>.json`. Writes
//! go through a temp file and an atomic rename so a crash mid-save never
//! leaves a truncated checkpoint behind.

use std::path::PathBuf;

use pipewright_core::checkpoint::{CheckpointError, CheckpointStore};
use pipewright_types::checkpoint::CheckpointState;
use uuid::Uuid;

/// Stores checkpoint state as JSON files in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first
    /// save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory this store writes into.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn store_err(err: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Store(err.to_string())
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(store_err)?;

        let json = serde_json::to_vec_pretty(state).map_err(store_err)?;
        let path = self.path_for(state.run_id);
        let tmp = self.dir.join(format!("{}.json.tmp", state.run_id));

        tokio::fs::write(&tmp, &json).await.map_err(store_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(store_err)?;

        tracing::debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<CheckpointState>, CheckpointError> {
        let path = self.path_for(run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(store_err(err)),
        };
        let state = serde_json::from_str(&content).map_err(store_err)?;
        Ok(Some(state))
    }

    async fn list(&self) -> Result<Vec<CheckpointState>, CheckpointError> {
        let mut states = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(states),
            Err(err) => return Err(store_err(err)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(store_err)? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<CheckpointState>(&content) {
                    Ok(state) => states.push(state),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "skipping unreadable checkpoint");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable checkpoint");
                }
            }
        }

        states.sort_by(|a, b| a.saved_at.cmp(&b.saved_at));
        Ok(states)
    }

    async fn delete(&self, run_id: Uuid) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(store_err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipewright_types::workflow::{StepResult, StepStatus};
    use std::collections::BTreeMap;

    fn sample_state(run_id: Uuid) -> CheckpointState {
        CheckpointState {
            workflow_name: "ship-feature".to_string(),
            workflow_version: "1.0.0".to_string(),
            run_id,
            inputs: BTreeMap::from([("task".to_string(), serde_json::json!("fix it"))]),
            results: vec![StepResult {
                name: "implement".to_string(),
                status: StepStatus::Completed,
                output: Some(serde_json::json!(["src/lib.rs"])),
                error: None,
                duration_ms: 10,
                attempts: 1,
                scope: String::new(),
            }],
            cursor: vec![pipewright_types::checkpoint::CursorFrame::new("", 1)],
            label: None,
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let run_id = Uuid::now_v7();

        store.save(&sample_state(run_id)).await.unwrap();
        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_name, "ship-feature");
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].name, "implement");

        // No stray temp file left behind
        let names: Vec<String> = std::fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "names: {names:?}");
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let run_id = Uuid::now_v7();

        let mut state = sample_state(run_id);
        store.save(&state).await.unwrap();
        state.cursor = vec![pipewright_types::checkpoint::CursorFrame::new("", 2)];
        store.save(&state).await.unwrap();

        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor[0].index, 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();

        store.save(&sample_state(first)).await.unwrap();
        store.save(&sample_state(second)).await.unwrap();
        // A non-checkpoint file is skipped, not an error
        std::fs::write(dir.path().join("notes.txt"), "not json").unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{ not valid").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete(first).await.unwrap());
        assert!(!store.delete(first).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_empty_dir_before_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
