//! Local command runner for `action` steps.
//!
//! Actions are mapped to argv templates in configuration; a step's rendered
//! arguments fill `{name}` placeholders in the template. Commands run via
//! `tokio::process`, and a nonzero exit status fails the step (subject to its
//! retry policy).

use std::collections::HashMap;
use std::path::PathBuf;

use pipewright_core::handler::{HandlerError, HandlerInvocation, StepHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One runnable action: a program and its argv template.
///
/// Template arguments may contain `{name}` placeholders filled from the
/// step's `args` map:
///
/// ```toml
/// [actions.git-commit]
/// program = "git"
/// args = ["commit", "-m", "{message}"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Executes `action` steps as local processes.
pub struct CommandActionHandler {
    actions: HashMap<String, CommandSpec>,
    workdir: Option<PathBuf>,
}

impl CommandActionHandler {
    pub fn new(actions: HashMap<String, CommandSpec>) -> Self {
        Self {
            actions,
            workdir: None,
        }
    }

    /// Run all commands from the given working directory.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

/// Fill `{name}` placeholders from the step's argument map.
fn fill_placeholders(template: &str, args: &serde_json::Map<String, Value>) -> String {
    let mut filled = template.to_string();
    for (name, value) in args {
        let marker = format!("{{{name}}}");
        if filled.contains(&marker) {
            filled = filled.replace(&marker, &value_as_arg(value));
        }
    }
    filled
}

fn value_as_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl StepHandler for CommandActionHandler {
    async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        let action = invocation.payload["action"].as_str().unwrap_or_default();
        let Some(spec) = self.actions.get(action) else {
            return Err(HandlerError::UnknownTarget {
                kind: "action",
                name: action.to_string(),
            });
        };

        let empty = serde_json::Map::new();
        let step_args = invocation.payload["args"].as_object().unwrap_or(&empty);
        let argv: Vec<String> = spec
            .args
            .iter()
            .map(|template| fill_placeholders(template, step_args))
            .collect();

        tracing::debug!(
            step = invocation.step_name.as_str(),
            action,
            program = spec.program.as_str(),
            ?argv,
            "running action command"
        );

        let mut command = tokio::process::Command::new(&spec.program);
        command.args(&argv).kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|err| HandlerError::Failed(format!("failed to spawn '{}': {err}", spec.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join("; ");
            return Err(HandlerError::Failed(format!(
                "'{action}' exited with {}: {tail}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // JSON stdout passes through with its structure intact
        let parsed = serde_json::from_str::<Value>(&stdout).unwrap_or(Value::String(stdout));
        Ok(json!({ "action": action, "output": parsed }))
    }
}
