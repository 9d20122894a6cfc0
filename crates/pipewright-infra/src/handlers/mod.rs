//! Step handler implementations.
//!
//! `command` runs action steps as local processes; `stub` supplies
//! placeholder handlers for the step types whose live collaborators (agent
//! backends, validation runners, nested workflow execution) are wired in
//! separately.

pub mod command;
pub mod stub;

use pipewright_core::handler::{HandlerKind, HandlerRegistry};

use command::CommandActionHandler;
use stub::{StubAgentHandler, StubSubworkflowHandler, StubTextHandler, StubValidateHandler};

/// Build a registry covering every handler-backed step type: the command
/// runner for actions, placeholders for the rest.
pub fn default_registry(actions: CommandActionHandler) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(HandlerKind::Action, actions)
        .with(HandlerKind::AgentCall, StubAgentHandler)
        .with(HandlerKind::TextGenerate, StubTextHandler)
        .with(HandlerKind::Validate, StubValidateHandler)
        .with(HandlerKind::Subworkflow, StubSubworkflowHandler)
}
