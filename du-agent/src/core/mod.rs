//! Deterministic value types and transformations used by the agent.
//!
//! Core modules perform no I/O. They parse cloud payloads, define the result and
//! state vocabulary, and build reporting documents.

pub mod action;
pub mod manifest;
pub mod report;
pub mod result;
pub mod state;
