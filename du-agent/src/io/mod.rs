//! Side-effecting collaborators of the orchestrator.
//!
//! Each concern sits behind a narrow trait so tests can swap in doubles.

pub mod config;
pub mod content_handler;
pub mod persistence;
pub mod process;
pub mod transport;
