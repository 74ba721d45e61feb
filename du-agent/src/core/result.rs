//! Result values reported for workflows and their steps.
//!
//! A result is a plain value: handlers return one per phase, the orchestrator
//! copies it onto a tree node, and the report serializer reads it back.

use serde::{Deserialize, Serialize};

/// Result codes, grouped by the phase that produces them.
///
/// Any code `> 0` is a success; `0` and below are failures.
pub mod codes {
    pub const FAILURE: i32 = 0;
    pub const FAILURE_CANCELLED: i32 = -1;

    pub const SUCCESS: i32 = 1;
    /// Non-error sentinel for a node whose handler has not run yet.
    pub const NOT_STARTED: i32 = 2;
    pub const DEPLOYMENT_IN_PROGRESS: i32 = 3;

    pub const DOWNLOAD_SUCCESS: i32 = 500;
    pub const DOWNLOAD_IN_PROGRESS: i32 = 501;
    pub const DOWNLOAD_SKIPPED_FILE_EXISTS: i32 = 502;
    pub const DOWNLOAD_SKIPPED_ALREADY_INSTALLED: i32 = 503;

    pub const INSTALL_SUCCESS: i32 = 600;
    pub const INSTALL_IN_PROGRESS: i32 = 601;
    pub const INSTALL_SKIPPED_ALREADY_INSTALLED: i32 = 603;
    pub const INSTALL_REQUIRED_IMMEDIATE_REBOOT: i32 = 605;
    pub const INSTALL_REQUIRED_REBOOT: i32 = 606;
    pub const INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART: i32 = 607;
    pub const INSTALL_REQUIRED_AGENT_RESTART: i32 = 608;

    pub const APPLY_SUCCESS: i32 = 700;
    pub const APPLY_IN_PROGRESS: i32 = 701;
    pub const APPLY_REQUIRED_IMMEDIATE_REBOOT: i32 = 705;
    pub const APPLY_REQUIRED_REBOOT: i32 = 706;
    pub const APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART: i32 = 707;
    pub const APPLY_REQUIRED_AGENT_RESTART: i32 = 708;

    pub const CANCEL_SUCCESS: i32 = 800;
    pub const CANCEL_UNABLE_TO_CANCEL: i32 = 801;

    pub const IS_INSTALLED_INSTALLED: i32 = 900;
    pub const IS_INSTALLED_NOT_INSTALLED: i32 = 901;
}

/// Extended result codes raised by the agent itself (facility `0x30`).
pub mod erc {
    const FACILITY: i32 = 0x3000_0000;

    pub const MANIFEST_INVALID: i32 = FACILITY | 0x001;
    pub const HANDLER_NOT_FOUND: i32 = FACILITY | 0x002;
    pub const PERSIST_FAILED: i32 = FACILITY | 0x003;
    pub const REBOOT_FAILED: i32 = FACILITY | 0x004;
    pub const RESTART_FAILED: i32 = FACILITY | 0x005;
    pub const STEP_FAILED: i32 = FACILITY | 0x006;
    pub const RESUME_NOT_INSTALLED: i32 = FACILITY | 0x007;
    pub const RESUME_INDETERMINATE: i32 = FACILITY | 0x008;
    pub const APPLY_WITHOUT_INSTALL: i32 = FACILITY | 0x009;
    pub const CANCELLED: i32 = FACILITY | 0x00a;
}

/// `{resultCode, extendedResultCode, resultDetails}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub result_code: i32,
    pub extended_result_code: i32,
    pub result_details: Option<String>,
}

impl Default for UpdateResult {
    fn default() -> Self {
        Self::not_started()
    }
}

impl UpdateResult {
    pub const fn new(result_code: i32, extended_result_code: i32) -> Self {
        Self {
            result_code,
            extended_result_code,
            result_details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.result_details = Some(details.into());
        self
    }

    pub const fn not_started() -> Self {
        Self::new(codes::NOT_STARTED, 0)
    }

    pub const fn failure(extended_result_code: i32) -> Self {
        Self::new(codes::FAILURE, extended_result_code)
    }

    pub const fn cancelled() -> Self {
        Self::new(codes::FAILURE_CANCELLED, erc::CANCELLED)
    }

    pub fn is_success(&self) -> bool {
        self.result_code > 0
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// True for the install/apply codes that ask for a reboot or agent restart.
    pub fn restart_request(&self) -> Option<RestartRequest> {
        use codes::{
            APPLY_REQUIRED_AGENT_RESTART, APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART,
            APPLY_REQUIRED_IMMEDIATE_REBOOT, APPLY_REQUIRED_REBOOT,
            INSTALL_REQUIRED_AGENT_RESTART, INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART,
            INSTALL_REQUIRED_IMMEDIATE_REBOOT, INSTALL_REQUIRED_REBOOT,
        };
        let (kind, immediate) = match self.result_code {
            INSTALL_REQUIRED_IMMEDIATE_REBOOT | APPLY_REQUIRED_IMMEDIATE_REBOOT => {
                (RestartKind::Reboot, true)
            }
            INSTALL_REQUIRED_REBOOT | APPLY_REQUIRED_REBOOT => (RestartKind::Reboot, false),
            INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART | APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART => {
                (RestartKind::AgentRestart, true)
            }
            INSTALL_REQUIRED_AGENT_RESTART | APPLY_REQUIRED_AGENT_RESTART => {
                (RestartKind::AgentRestart, false)
            }
            _ => return None,
        };
        Some(RestartRequest { kind, immediate })
    }
}

/// Which process-ending action a handler asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    Reboot,
    AgentRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest {
    pub kind: RestartKind,
    pub immediate: bool,
}

/// Tri-state answer of a handler's IsInstalled check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledState {
    Installed,
    NotInstalled,
    Indeterminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_result_is_non_error_sentinel() {
        let result = UpdateResult::default();
        assert_eq!(result.result_code, codes::NOT_STARTED);
        assert!(result.is_success());
        assert_eq!(result.result_details, None);
    }

    #[test]
    fn zero_and_negative_codes_are_failures() {
        assert!(UpdateResult::failure(42).is_failure());
        assert!(UpdateResult::cancelled().is_failure());
        assert!(UpdateResult::new(codes::APPLY_SUCCESS, 0).is_success());
    }

    #[test]
    fn restart_request_distinguishes_kind_and_urgency() {
        let immediate = UpdateResult::new(codes::APPLY_REQUIRED_IMMEDIATE_REBOOT, 0);
        assert_eq!(
            immediate.restart_request(),
            Some(RestartRequest {
                kind: RestartKind::Reboot,
                immediate: true
            })
        );

        let deferred = UpdateResult::new(codes::INSTALL_REQUIRED_AGENT_RESTART, 0);
        assert_eq!(
            deferred.restart_request(),
            Some(RestartRequest {
                kind: RestartKind::AgentRestart,
                immediate: false
            })
        );

        assert_eq!(
            UpdateResult::new(codes::INSTALL_SUCCESS, 0).restart_request(),
            None
        );
    }

    #[test]
    fn serializes_with_camel_case_and_null_details() {
        let value = serde_json::to_value(UpdateResult::new(codes::SUCCESS, 7)).expect("json");
        assert_eq!(
            value,
            serde_json::json!({
                "resultCode": 1,
                "extendedResultCode": 7,
                "resultDetails": null
            })
        );
    }
}
