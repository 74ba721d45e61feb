//! Device update agent core.
//!
//! Executes cloud-initiated update workflows through pluggable content handlers,
//! survives self-initiated reboots and restarts through a persisted snapshot, and
//! reports progress to the cloud as a structured JSON document.
//!
//! - **[`core`]**: Pure logic (result model, actions, manifest parsing, reports).
//! - **[`io`]**: Side-effecting collaborators behind narrow traits (transport,
//!   snapshot store, content handlers, reboot/restart, configuration).
//!
//! [`workflow`] is the orchestrator; [`bridge`] feeds it cloud property changes.

pub mod bridge;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
pub mod workflow;
