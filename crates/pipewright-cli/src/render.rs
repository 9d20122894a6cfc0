//! Terminal rendering of progress events.
//!
//! Styled, single-line-per-event output by default; `--json` switches to
//! NDJSON (one serialized event per line) for machine consumption.

use console::style;
use pipewright_types::event::ProgressEvent;
use pipewright_types::workflow::StepStatus;

/// Print one event. Quiet mode drops everything except failures.
pub fn render_event(event: &ProgressEvent, json: bool, quiet: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    if quiet && !is_failure(event) {
        return;
    }

    match event {
        ProgressEvent::WorkflowStarted { workflow_name, .. } => {
            println!("{} {}", style("▶").cyan(), style(workflow_name).bold());
        }
        ProgressEvent::WorkflowCompleted {
            success,
            duration_ms,
            ..
        } => {
            if *success {
                println!("{} done in {duration_ms}ms", style("✓").green().bold());
            } else {
                println!("{} failed after {duration_ms}ms", style("✗").red().bold());
            }
        }
        ProgressEvent::StepStarted {
            step_name,
            step_type,
            ..
        } => {
            println!("  {} {step_name} {}", style("▶").cyan(), style(format!("({step_type})")).dim());
        }
        ProgressEvent::StepCompleted {
            step_name,
            status,
            duration_ms,
            ..
        } => {
            println!(
                "  {} {step_name} {}",
                status_glyph(*status),
                style(format!("{duration_ms}ms")).dim()
            );
        }
        ProgressEvent::LoopIterationStarted {
            loop_name,
            index,
            label,
            ..
        } => {
            println!(
                "    {} {loop_name}[{index}] {}",
                style("↻").cyan(),
                style(label).dim()
            );
        }
        ProgressEvent::LoopIterationCompleted {
            loop_name,
            index,
            status,
            ..
        } => {
            println!("    {} {loop_name}[{index}]", status_glyph(*status));
        }
        ProgressEvent::ValidationStarted { stages, .. } => {
            println!(
                "    {} validating: {}",
                style("▶").cyan(),
                style(stages.join(", ")).dim()
            );
        }
        ProgressEvent::ValidationCompleted { .. } => {
            println!("    {} validation passed", style("✓").green());
        }
        ProgressEvent::ValidationFailed { error, .. } => {
            println!("    {} validation failed: {error}", style("✗").red());
        }
        ProgressEvent::RollbackStarted {
            for_step,
            rollback_step,
            ..
        } => {
            println!(
                "  {} rolling back '{for_step}' via '{rollback_step}'",
                style("↺").yellow()
            );
        }
        ProgressEvent::RollbackCompleted { for_step, .. } => {
            println!("  {} rolled back '{for_step}'", style("✓").green());
        }
        ProgressEvent::RollbackError { for_step, error, .. } => {
            println!(
                "  {} rollback of '{for_step}' failed: {error}",
                style("✗").red()
            );
        }
        ProgressEvent::CheckpointSaved { label, .. } => match label {
            Some(label) => println!("  {} checkpoint '{label}'", style("⚑").magenta()),
            None => {}
        },
    }
}

fn status_glyph(status: StepStatus) -> console::StyledObject<&'static str> {
    match status {
        StepStatus::Completed => style("✓").green(),
        StepStatus::Failed => style("✗").red(),
        StepStatus::Skipped => style("⊘").dim(),
        StepStatus::Cancelled => style("⊘").yellow(),
    }
}

fn is_failure(event: &ProgressEvent) -> bool {
    matches!(
        event,
        ProgressEvent::StepCompleted {
            status: StepStatus::Failed,
            ..
        } | ProgressEvent::ValidationFailed { .. }
            | ProgressEvent::RollbackError { .. }
            | ProgressEvent::WorkflowCompleted { success: false, .. }
    )
}
