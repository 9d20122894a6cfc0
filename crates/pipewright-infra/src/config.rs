//! Configuration loader for Pipewright.
//!
//! Reads `config.toml` from the data directory (`~/.pipewright/` by default)
//! and falls back to defaults when the file is missing or malformed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::handlers::command::CommandSpec;

/// Tool-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewrightConfig {
    /// Action name -> command template for the command action handler.
    #[serde(default)]
    pub actions: HashMap<String, CommandSpec>,
    /// Directory workflows are discovered from (relative to the data dir
    /// when not absolute).
    #[serde(default)]
    pub workflow_dir: Option<PathBuf>,
}

/// Default data directory: `~/.pipewright`, or `./.pipewright` when no home
/// directory is resolvable.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".pipewright"))
        .unwrap_or_else(|| PathBuf::from(".pipewright"))
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparseable file: warning, then defaults.
pub async fn load_config(data_dir: &Path) -> PipewrightConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            return PipewrightConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), %err, "failed to read config, using defaults");
            return PipewrightConfig::default();
        }
    };

    match toml::from_str::<PipewrightConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), %err, "failed to parse config, using defaults");
            PipewrightConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert!(config.actions.is_empty());
        assert!(config.workflow_dir.is_none());
    }

    #[tokio::test]
    async fn test_valid_toml_parses() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
workflow_dir = "workflows"

[actions.git-commit]
program = "git"
args = ["commit", "-m", "{message}"]

[actions.run-tests]
program = "cargo"
args = ["test"]
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.workflow_dir, Some(PathBuf::from("workflows")));
        assert_eq!(config.actions.len(), 2);
        assert_eq!(config.actions["git-commit"].program, "git");
        assert_eq!(config.actions["git-commit"].args[2], "{message}");
    }

    #[tokio::test]
    async fn test_invalid_toml_returns_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml")
            .await
            .unwrap();
        let config = load_config(tmp.path()).await;
        assert!(config.actions.is_empty());
    }

    #[test]
    fn test_default_data_dir_is_stable() {
        let dir = default_data_dir();
        assert!(dir.to_string_lossy().contains(".pipewright"));
    }
}
