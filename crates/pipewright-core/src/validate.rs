//! Pre-execution validation of workflow definitions.
//!
//! This is a hard gate: a definition that fails validation never starts
//! executing. Checks cover naming, retry/concurrency parameters, embedded
//! expression syntax, loop-variable scoping, and -- most importantly --
//! forward references: every `steps.<name>` reference must name a step that
//! occurs strictly earlier in an already-executed position. Parallel siblings
//! are not "earlier" than one another; loop body outputs are scoped to their
//! iteration and invisible outside the loop.

use std::collections::HashSet;

use pipewright_types::workflow::{Backoff, InputSpec, Step, StepKind, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;

use crate::expression::{self, Expr};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural validation failures. The workflow never starts when any of
/// these is raised.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow name '{0}' is invalid (non-empty, alphanumeric and hyphens only)")]
    InvalidWorkflowName(String),

    #[error("workflow version '{0}' is not a valid semantic version")]
    InvalidVersion(String),

    #[error("workflow must have at least one step")]
    NoSteps,

    #[error("duplicate input '{0}'")]
    DuplicateInput(String),

    #[error("input '{0}' is required but declares a default")]
    DefaultOnRequiredInput(String),

    #[error("step name '{0}' is invalid (non-empty, alphanumeric, hyphens, underscores)")]
    InvalidStepName(String),

    #[error("duplicate step name '{name}' in scope '{scope}'")]
    DuplicateStepName { scope: String, name: String },

    #[error("step '{step}' references step '{referenced}' which has not executed at that point")]
    ForwardReference { step: String, referenced: String },

    #[error("step '{step}' uses loop variable '{var}' outside any loop")]
    LoopVariableOutsideLoop { step: String, var: String },

    #[error("step '{step}' references unknown identifier '{ident}'")]
    UnknownIdentifier { step: String, ident: String },

    #[error("invalid expression in step '{step}': {error}")]
    Expression { step: String, error: String },

    #[error("invalid expression in output '{output}': {error}")]
    OutputExpression { output: String, error: String },

    #[error("output '{output}' references step '{referenced}' which never executes at top level")]
    OutputReference { output: String, referenced: String },

    #[error("step '{step}' has invalid retry policy: {reason}")]
    InvalidRetry { step: String, reason: String },

    #[error("step '{step}' has invalid max_concurrency (must be >= 1)")]
    InvalidConcurrency { step: String },

    #[error("step '{step}' has an empty {what}")]
    Empty { step: String, what: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Validate a workflow definition. Runs once, before any step executes.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.name.is_empty() || !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(ValidationError::InvalidWorkflowName(def.name.clone()));
    }

    if semver::Version::parse(&def.version).is_err() {
        return Err(ValidationError::InvalidVersion(def.version.clone()));
    }

    if def.steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    validate_inputs(&def.inputs)?;

    let mut known = HashSet::new();
    validate_sequence(&def.steps, &mut known, &[], "")?;

    // Output mapping: may reference any top-level settled step, never loop vars
    for (output_name, expr_str) in &def.outputs {
        let expr = expression::parse(expr_str).map_err(|e| ValidationError::OutputExpression {
            output: output_name.clone(),
            error: e.to_string(),
        })?;
        for referenced in expression::referenced_steps(&expr) {
            if !known.contains(&referenced) {
                return Err(ValidationError::OutputReference {
                    output: output_name.clone(),
                    referenced,
                });
            }
        }
        for ident in root_identifiers(&expr) {
            if !matches!(ident.as_str(), "inputs" | "steps" | "workflow") {
                return Err(ValidationError::OutputExpression {
                    output: output_name.clone(),
                    error: format!("unknown identifier '{ident}'"),
                });
            }
        }
    }

    Ok(())
}

fn validate_inputs(inputs: &[InputSpec]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for input in inputs {
        if !seen.insert(input.name.as_str()) {
            return Err(ValidationError::DuplicateInput(input.name.clone()));
        }
        if input.required && input.default.is_some() {
            return Err(ValidationError::DefaultOnRequiredInput(input.name.clone()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step walking
// ---------------------------------------------------------------------------

/// Validate a sequential scope. Each validated step's name joins `known` so
/// later siblings may reference it.
fn validate_sequence(
    steps: &[Step],
    known: &mut HashSet<String>,
    loop_vars: &[String],
    scope: &str,
) -> Result<(), ValidationError> {
    let mut siblings = HashSet::new();
    for step in steps {
        if !siblings.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStepName {
                scope: scope.to_string(),
                name: step.name.clone(),
            });
        }
    }

    for step in steps {
        validate_step(step, known, loop_vars, scope)?;
        known.insert(step.name.clone());
    }

    Ok(())
}

fn validate_step(
    step: &Step,
    known: &mut HashSet<String>,
    loop_vars: &[String],
    scope: &str,
) -> Result<(), ValidationError> {
    if step.name.is_empty()
        || !step
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidStepName(step.name.clone()));
    }

    if let Some(when) = &step.when {
        check_expression(when, &step.name, known, loop_vars)?;
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(ValidationError::InvalidRetry {
                step: step.name.clone(),
                reason: "max_attempts must be >= 1".to_string(),
            });
        }
        if let Backoff::Exponential { base_delay_ms } = retry.backoff {
            if base_delay_ms == 0 {
                return Err(ValidationError::InvalidRetry {
                    step: step.name.clone(),
                    reason: "exponential backoff base_delay_ms must be >= 1".to_string(),
                });
            }
        }
    }

    match &step.kind {
        StepKind::Action { action, args } => {
            if action.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "action name".to_string(),
                });
            }
            check_payload_templates(&Value::Object(args.clone()), &step.name, known, loop_vars)?;
        }
        StepKind::AgentCall {
            capability,
            context,
        } => {
            if capability.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "capability name".to_string(),
                });
            }
            check_payload_templates(&Value::Object(context.clone()), &step.name, known, loop_vars)?;
        }
        StepKind::TextGenerate { generator, context } => {
            if generator.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "generator name".to_string(),
                });
            }
            check_payload_templates(&Value::Object(context.clone()), &step.name, known, loop_vars)?;
        }
        StepKind::Validate { stages } => {
            if stages.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "stage list".to_string(),
                });
            }
        }
        StepKind::Parallel {
            steps: children,
            max_concurrency,
        } => {
            if children.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "parallel group".to_string(),
                });
            }
            if max_concurrency.is_some_and(|c| c < 1) {
                return Err(ValidationError::InvalidConcurrency {
                    step: step.name.clone(),
                });
            }
            let mut siblings = HashSet::new();
            for child in children {
                if !siblings.insert(child.name.as_str()) {
                    return Err(ValidationError::DuplicateStepName {
                        scope: step.name.clone(),
                        name: child.name.clone(),
                    });
                }
            }
            // Each child sees only what executed before the group, never its
            // concurrent siblings -- there is no ordering guarantee among them.
            for child in children {
                let mut child_known = known.clone();
                validate_step(child, &mut child_known, loop_vars, &step.name)?;
            }
            // After the join, every child has settled
            for child in children {
                known.insert(child.name.clone());
            }
        }
        StepKind::Loop {
            items,
            item_var,
            body,
            max_concurrency,
        } => {
            if body.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "loop body".to_string(),
                });
            }
            if max_concurrency.is_some_and(|c| c < 1) {
                return Err(ValidationError::InvalidConcurrency {
                    step: step.name.clone(),
                });
            }
            // The items expression evaluates before the loop frame is pushed,
            // so it sees outer loop variables only.
            check_expression(items, &step.name, known, loop_vars)?;

            let var = item_var.clone().unwrap_or_else(|| "item".to_string());
            let mut inner_vars = loop_vars.to_vec();
            inner_vars.push(var);

            // Body outputs are iteration-scoped: validate against a copy of
            // `known` and discard the names afterwards.
            let mut body_known = known.clone();
            validate_sequence(body, &mut body_known, &inner_vars, &step.name)?;
        }
        StepKind::Subworkflow { workflow, inputs } => {
            if workflow.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "workflow reference".to_string(),
                });
            }
            for expr_str in inputs.values() {
                check_expression(expr_str, &step.name, known, loop_vars)?;
            }
        }
        StepKind::Checkpoint { label } => {
            if label.is_empty() {
                return Err(ValidationError::Empty {
                    step: step.name.clone(),
                    what: "checkpoint label".to_string(),
                });
            }
        }
    }

    // Fallback step: runs after the owning step failed, so it must not
    // reference the owner's output.
    if let Some(fallback) = &step.on_failure {
        let mut fallback_known = known.clone();
        validate_step(fallback, &mut fallback_known, loop_vars, scope)?;
    }

    // Rollback step: runs only after the owning step completed.
    if let Some(rollback) = &step.rollback {
        let mut rollback_known = known.clone();
        rollback_known.insert(step.name.clone());
        validate_step(rollback, &mut rollback_known, loop_vars, scope)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Expression checks
// ---------------------------------------------------------------------------

/// Parse an expression and verify its step references and identifier roots.
fn check_expression(
    expr_str: &str,
    step_name: &str,
    known: &HashSet<String>,
    loop_vars: &[String],
) -> Result<(), ValidationError> {
    let expr = expression::parse(expr_str).map_err(|e| ValidationError::Expression {
        step: step_name.to_string(),
        error: e.to_string(),
    })?;
    check_parsed(&expr, step_name, known, loop_vars)
}

fn check_parsed(
    expr: &Expr,
    step_name: &str,
    known: &HashSet<String>,
    loop_vars: &[String],
) -> Result<(), ValidationError> {
    for referenced in expression::referenced_steps(expr) {
        if !known.contains(&referenced) {
            return Err(ValidationError::ForwardReference {
                step: step_name.to_string(),
                referenced,
            });
        }
    }

    for ident in root_identifiers(expr) {
        match ident.as_str() {
            "inputs" | "steps" | "workflow" => {}
            "item" | "index" => {
                if loop_vars.is_empty() {
                    return Err(ValidationError::LoopVariableOutsideLoop {
                        step: step_name.to_string(),
                        var: ident,
                    });
                }
            }
            other if loop_vars.iter().any(|v| v == other) => {}
            other => {
                return Err(ValidationError::UnknownIdentifier {
                    step: step_name.to_string(),
                    ident: other.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Check every `{{ expr }}` marker embedded in a handler payload.
fn check_payload_templates(
    payload: &Value,
    step_name: &str,
    known: &HashSet<String>,
    loop_vars: &[String],
) -> Result<(), ValidationError> {
    match payload {
        Value::String(s) => {
            let exprs =
                expression::template_expressions(s).map_err(|e| ValidationError::Expression {
                    step: step_name.to_string(),
                    error: e.to_string(),
                })?;
            for expr_str in exprs {
                check_expression(&expr_str, step_name, known, loop_vars)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_payload_templates(item, step_name, known, loop_vars)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for value in map.values() {
                check_payload_templates(value, step_name, known, loop_vars)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Every `Expr::Ident` node is a root lookup in the evaluation context.
fn root_identifiers(expr: &Expr) -> Vec<String> {
    let mut idents = Vec::new();
    collect_roots(expr, &mut idents);
    idents
}

fn collect_roots(expr: &Expr, idents: &mut Vec<String>) {
    match expr {
        Expr::Ident(name) => idents.push(name.clone()),
        Expr::Member(base, _) => collect_roots(base, idents),
        Expr::Index(base, index) => {
            collect_roots(base, idents);
            collect_roots(index, idents);
        }
        Expr::List(items) => {
            for item in items {
                collect_roots(item, idents);
            }
        }
        Expr::Not(inner) => collect_roots(inner, idents),
        Expr::Binary(_, left, right) => {
            collect_roots(left, idents);
            collect_roots(right, idents);
        }
        Expr::Conditional {
            value,
            cond,
            fallback,
        } => {
            collect_roots(value, idents);
            collect_roots(cond, idents);
            collect_roots(fallback, idents);
        }
        Expr::Literal(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
