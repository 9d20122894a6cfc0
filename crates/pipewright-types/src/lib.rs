//! Shared domain types for Pipewright.
//!
//! This crate holds the canonical, serde-serializable representation of a
//! workflow (definitions, steps, retry policy), execution tracking types
//! (`StepResult`, `WorkflowResult`), checkpoint state, and the progress event
//! union. It depends on nothing but serialization and identity crates -- all
//! behavior lives in `pipewright-core`.

pub mod checkpoint;
pub mod event;
pub mod workflow;
