//! Checkpoint store implementations.

pub mod file;

pub use file::FileCheckpointStore;
