//! Command handlers for the `pwright` binary.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use comfy_table::{presets, Table};
use console::style;
use pipewright_core::checkpoint::CheckpointStore;
use pipewright_core::definition::load_workflow_file;
use pipewright_core::orchestrator::{Orchestrator, RunHandle};
use pipewright_infra::config::load_config;
use pipewright_infra::handlers::command::CommandActionHandler;
use pipewright_infra::handlers::default_registry;
use pipewright_infra::store::FileCheckpointStore;
use serde_json::Value;
use uuid::Uuid;

use crate::render::render_event;

/// Build the orchestrator from configuration: configured action commands plus
/// placeholder handlers, backed by the file checkpoint store.
async fn build_orchestrator(data_dir: &Path) -> Orchestrator<FileCheckpointStore> {
    let config = load_config(data_dir).await;
    let actions = CommandActionHandler::new(config.actions);
    let registry = default_registry(actions);
    let store = FileCheckpointStore::new(data_dir.join("checkpoints"));
    Orchestrator::new(registry, store)
}

/// Parse `key=value` inputs; values parse as JSON when possible, otherwise
/// they are taken as strings (`--input count=3` is a number, `--input
/// task="fix the parser"` is a string).
fn parse_inputs(pairs: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid input '{pair}', expected key=value");
        };
        let value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

/// Drain the run's event stream to the terminal, then report the result.
async fn drive_to_completion(
    mut handle: RunHandle,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    if !quiet && !json {
        eprintln!("{} run {}", style("started").green().bold(), handle.run_id);
    }

    while let Some(event) = handle.events.recv().await {
        render_event(&event, json, quiet);
    }

    let result = handle.join().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if !result.outputs.is_empty() {
            println!("{}", style("outputs:").bold());
            for (name, value) in &result.outputs {
                println!("  {name} = {value}");
            }
        }
        let status = if result.success {
            style("succeeded").green().bold()
        } else {
            style("failed").red().bold()
        };
        println!(
            "workflow '{}' {status} in {}ms (run {})",
            result.workflow_name, result.duration_ms, result.run_id
        );
    }

    if !result.success {
        bail!(
            "workflow failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

/// `pwright run <file> [--input k=v]...`
pub async fn run(
    data_dir: &Path,
    file: &Path,
    input_pairs: &[String],
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("failed to load workflow from {}", file.display()))?;
    let inputs = parse_inputs(input_pairs)?;

    let orchestrator = build_orchestrator(data_dir).await;
    let handle = orchestrator.start(definition, inputs);
    drive_to_completion(handle, json, quiet).await
}

/// `pwright resume <run-id> <file>`
pub async fn resume(
    data_dir: &Path,
    run_id: Uuid,
    file: &Path,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("failed to load workflow from {}", file.display()))?;

    let orchestrator = build_orchestrator(data_dir).await;
    let handle = orchestrator.resume(definition, run_id);
    drive_to_completion(handle, json, quiet).await
}

/// `pwright validate <file>` -- parse and validate without executing.
pub fn validate(file: &Path, json: bool) -> anyhow::Result<()> {
    match load_workflow_file(file) {
        Ok(definition) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "valid": true,
                        "name": definition.name,
                        "version": definition.version,
                        "steps": definition.steps.len(),
                    })
                );
            } else {
                println!(
                    "{} workflow '{}' v{} ({} steps)",
                    style("valid").green().bold(),
                    definition.name,
                    definition.version,
                    definition.steps.len()
                );
            }
            Ok(())
        }
        Err(err) => bail!("{}: {err}", file.display()),
    }
}

/// `pwright runs` -- list checkpointed runs from the store.
pub async fn list_runs(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let store = FileCheckpointStore::new(data_dir.join("checkpoints"));
    let states = store
        .list()
        .await
        .map_err(|err| anyhow::anyhow!("failed to list runs: {err}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    if states.is_empty() {
        println!("no checkpointed runs");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_BORDERS_ONLY);
    table.set_header(["run", "workflow", "version", "steps", "label", "saved at"]);
    for state in &states {
        table.add_row([
            state.run_id.to_string(),
            state.workflow_name.clone(),
            state.workflow_version.clone(),
            state.results.len().to_string(),
            state.label.clone().unwrap_or_default(),
            state.saved_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs_json_and_string() {
        let inputs = parse_inputs(&[
            "task=fix the parser".to_string(),
            "count=3".to_string(),
            "flag=true".to_string(),
            "files=[\"a.rs\",\"b.rs\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["task"], Value::String("fix the parser".to_string()));
        assert_eq!(inputs["count"], serde_json::json!(3));
        assert_eq!(inputs["flag"], serde_json::json!(true));
        assert_eq!(inputs["files"], serde_json::json!(["a.rs", "b.rs"]));
    }

    #[test]
    fn test_parse_inputs_rejects_missing_equals() {
        assert!(parse_inputs(&["no-equals-sign".to_string()]).is_err());
    }
}
