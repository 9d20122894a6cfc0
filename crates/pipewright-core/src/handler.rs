//! Step handler port and the constructor-injected handler registry.
//!
//! The engine executes `parallel`, `loop`, and `checkpoint` steps natively;
//! `action`, `agent_call`, `text_generate`, `validate`, and `subworkflow`
//! steps are delegated to externally supplied [`StepHandler`]s. Handlers are
//! registered explicitly on a [`HandlerRegistry`] passed into the
//! orchestrator -- there is no process-wide mutable registration.
//!
//! `StepHandler` uses RPITIT async methods; `BoxStepHandler` provides the
//! object-safe wrapper (same blanket-impl pattern as the rest of the
//! codebase's ports).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pipewright_types::workflow::{Step, StepKind, WorkflowDefinition};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A handler-raised failure. Always caught at the dispatcher boundary and
/// converted into a failed step result, subject to the step's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The handler does not know the named action/capability/generator.
    #[error("unknown {kind} '{name}'")]
    UnknownTarget { kind: &'static str, name: String },
}

// ---------------------------------------------------------------------------
// Handler kinds
// ---------------------------------------------------------------------------

/// The step kinds that require an external handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Action,
    AgentCall,
    TextGenerate,
    Validate,
    Subworkflow,
}

impl HandlerKind {
    /// The handler kind a step requires, if it is not engine-native.
    pub fn for_step(kind: &StepKind) -> Option<Self> {
        match kind {
            StepKind::Action { .. } => Some(HandlerKind::Action),
            StepKind::AgentCall { .. } => Some(HandlerKind::AgentCall),
            StepKind::TextGenerate { .. } => Some(HandlerKind::TextGenerate),
            StepKind::Validate { .. } => Some(HandlerKind::Validate),
            StepKind::Subworkflow { .. } => Some(HandlerKind::Subworkflow),
            StepKind::Parallel { .. } | StepKind::Loop { .. } | StepKind::Checkpoint { .. } => None,
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandlerKind::Action => "action",
            HandlerKind::AgentCall => "agent_call",
            HandlerKind::TextGenerate => "text_generate",
            HandlerKind::Validate => "validate",
            HandlerKind::Subworkflow => "subworkflow",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything a handler receives for one attempt.
///
/// `payload` is the step's kind-specific configuration with all
/// `{{ expr }}` templates already resolved; `context` is a read-only snapshot
/// of the expression context at dispatch time.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    pub kind: HandlerKind,
    pub payload: Value,
    pub context: Value,
    /// 1-based attempt number (increments on retry).
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// StepHandler port
// ---------------------------------------------------------------------------

/// External collaborator implementing the actual effect of a step.
///
/// Implementations are expected to be I/O-bound and opaque to the engine;
/// any per-invocation timeout is the handler's own concern. Attempts are not
/// assumed idempotent -- a fix-and-retry handler may mutate state between
/// attempts.
pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        invocation: HandlerInvocation,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn handle_boxed(
        &self,
        invocation: HandlerInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + '_>>;
}

/// Blanket implementation: any `StepHandler` is automatically `StepHandlerDyn`.
impl<T: StepHandler> StepHandlerDyn for T {
    fn handle_boxed(
        &self,
        invocation: HandlerInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send + '_>> {
        Box::pin(self.handle(invocation))
    }
}

/// Type-erased step handler for registry storage.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn handle(&self, invocation: HandlerInvocation) -> Result<Value, HandlerError> {
        self.inner.handle_boxed(invocation).await
    }
}

/// Adapter turning an async closure into a [`StepHandler`].
///
/// Mostly used by tests and placeholder wiring:
/// ```ignore
/// let handler = FnHandler::new(|inv| async move { Ok(json!(inv.step_name)) });
/// ```
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(HandlerInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    fn handle(
        &self,
        invocation: HandlerInvocation,
    ) -> impl Future<Output = Result<Value, HandlerError>> + Send {
        (self.0)(invocation)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit mapping from handler kind to handler implementation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<BoxStepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a step kind (builder style).
    pub fn with<T: StepHandler + 'static>(mut self, kind: HandlerKind, handler: T) -> Self {
        self.handlers.insert(kind, Arc::new(BoxStepHandler::new(handler)));
        self
    }

    /// Look up the handler for a step kind.
    pub fn get(&self, kind: HandlerKind) -> Option<Arc<BoxStepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Handler kinds a definition requires but this registry lacks.
    pub fn missing_for(&self, def: &WorkflowDefinition) -> Vec<HandlerKind> {
        let mut required = HashSet::new();
        collect_required(&def.steps, &mut required);
        let mut missing: Vec<HandlerKind> = required
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect();
        missing.sort_by_key(|k| k.to_string());
        missing
    }
}

fn collect_required(steps: &[Step], required: &mut HashSet<HandlerKind>) {
    for step in steps {
        if let Some(kind) = HandlerKind::for_step(&step.kind) {
            required.insert(kind);
        }
        match &step.kind {
            StepKind::Parallel { steps: children, .. } => collect_required(children, required),
            StepKind::Loop { body, .. } => collect_required(body, required),
            _ => {}
        }
        if let Some(fallback) = &step.on_failure {
            collect_required(std::slice::from_ref(fallback.as_ref()), required);
        }
        if let Some(rollback) = &step.rollback {
            collect_required(std::slice::from_ref(rollback.as_ref()), required);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
