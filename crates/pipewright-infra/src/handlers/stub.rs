//! Placeholder handlers for step types whose live collaborators are wired in
//! separately (agent backends, validation runners, nested workflow
//! execution). They echo their resolved payload so workflow files can be
//! exercised end to end before the real integrations exist.

use pipewright_core::handler::{HandlerError, HandlerInvocation, StepHandler};
use serde_json::{json, Value};

/// Placeholder for `agent_call` steps.
pub struct StubAgentHandler;

impl StepHandler for StubAgentHandler {
    async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        let capability = invocation.payload["capability"].as_str().unwrap_or_default();
        tracing::debug!(
            step = invocation.step_name.as_str(),
            capability,
            "running agent step (placeholder)"
        );
        Ok(json!({
            "capability": capability,
            "context": invocation.payload["context"],
            "output": format!("[placeholder] agent capability '{capability}' response"),
        }))
    }
}

/// Placeholder for `text_generate` steps.
pub struct StubTextHandler;

impl StepHandler for StubTextHandler {
    async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        let generator = invocation.payload["generator"].as_str().unwrap_or_default();
        tracing::debug!(
            step = invocation.step_name.as_str(),
            generator,
            "running text generation step (placeholder)"
        );
        Ok(json!(format!("[placeholder] text from generator '{generator}'")))
    }
}

/// Placeholder for `validate` steps: every stage passes.
pub struct StubValidateHandler;

impl StepHandler for StubValidateHandler {
    async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        let stages = invocation.payload["stages"].clone();
        tracing::debug!(
            step = invocation.step_name.as_str(),
            "running validation step (placeholder)"
        );
        Ok(json!({ "stages": stages, "passed": true }))
    }
}

/// Placeholder for `subworkflow` steps.
pub struct StubSubworkflowHandler;

impl StepHandler for StubSubworkflowHandler {
    async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        let workflow = invocation.payload["workflow"].as_str().unwrap_or_default();
        tracing::debug!(
            step = invocation.step_name.as_str(),
            workflow,
            "running subworkflow step (placeholder)"
        );
        Ok(json!({
            "workflow": workflow,
            "inputs": invocation.payload["inputs"],
            "output": format!("[placeholder] subworkflow '{workflow}' result"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::handler::HandlerKind;
    use uuid::Uuid;

    fn invocation(kind: HandlerKind, payload: Value) -> HandlerInvocation {
        HandlerInvocation {
            run_id: Uuid::now_v7(),
            workflow_name: "test".to_string(),
            step_name: "step".to_string(),
            kind,
            payload,
            context: json!({}),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_stub_agent_echoes_capability() {
        let result = StubAgentHandler
            .handle(invocation(
                HandlerKind::AgentCall,
                json!({ "capability": "implement-change", "context": { "task": "fix" } }),
            ))
            .await
            .unwrap();
        assert_eq!(result["capability"], json!("implement-change"));
        assert_eq!(result["context"]["task"], json!("fix"));
    }

    #[tokio::test]
    async fn test_stub_validate_passes_all_stages() {
        let result = StubValidateHandler
            .handle(invocation(
                HandlerKind::Validate,
                json!({ "stages": ["build", "tests"] }),
            ))
            .await
            .unwrap();
        assert_eq!(result["passed"], json!(true));
        assert_eq!(result["stages"], json!(["build", "tests"]));
    }

    #[tokio::test]
    async fn test_stub_text_returns_string() {
        let result = StubTextHandler
            .handle(invocation(
                HandlerKind::TextGenerate,
                json!({ "generator": "commit-message", "context": {} }),
            ))
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("commit-message"));
    }

    #[tokio::test]
    async fn test_stub_subworkflow_echoes_inputs() {
        let result = StubSubworkflowHandler
            .handle(invocation(
                HandlerKind::Subworkflow,
                json!({ "workflow": "open-pr", "inputs": { "branch": "main" } }),
            ))
            .await
            .unwrap();
        assert_eq!(result["workflow"], json!("open-pr"));
        assert_eq!(result["inputs"]["branch"], json!("main"));
    }
}
