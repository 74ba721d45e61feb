//! Workflow states reported to the cloud and the transitions between them.

use serde::{Serialize, Serializer};

/// State reported in the `state` field of the agent document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Idle,
    DownloadStarted,
    DownloadSucceeded,
    InstallStarted,
    InstallSucceeded,
    ApplyStarted,
    DeploymentInProgress,
    Failed,
}

impl UpdateState {
    pub fn code(self) -> i32 {
        match self {
            UpdateState::Idle => 0,
            UpdateState::DownloadStarted => 1,
            UpdateState::DownloadSucceeded => 2,
            UpdateState::InstallStarted => 3,
            UpdateState::InstallSucceeded => 4,
            UpdateState::ApplyStarted => 5,
            UpdateState::DeploymentInProgress => 6,
            UpdateState::Failed => 255,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let state = match code {
            0 => UpdateState::Idle,
            1 => UpdateState::DownloadStarted,
            2 => UpdateState::DownloadSucceeded,
            3 => UpdateState::InstallStarted,
            4 => UpdateState::InstallSucceeded,
            5 => UpdateState::ApplyStarted,
            6 => UpdateState::DeploymentInProgress,
            255 => UpdateState::Failed,
            _ => return None,
        };
        Some(state)
    }

    /// States after which no handler call is pending for the workflow.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            UpdateState::Idle | UpdateState::DownloadSucceeded | UpdateState::Failed
        )
    }

    /// Progress states that may be suppressed when intermediate reporting is off.
    pub fn is_intermediate(self) -> bool {
        matches!(
            self,
            UpdateState::DownloadSucceeded
                | UpdateState::InstallStarted
                | UpdateState::InstallSucceeded
                | UpdateState::ApplyStarted
        )
    }

    /// Reports in these states must clear any previous `stepResults`.
    pub fn clears_step_results(self) -> bool {
        matches!(
            self,
            UpdateState::DownloadStarted | UpdateState::DeploymentInProgress
        )
    }
}

impl Serialize for UpdateState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// True if the orchestrator may move from `from` to `to`.
///
/// `Idle` and `Failed` are reachable from anywhere (terminal reports, cancel),
/// and a resting state may start a new workflow.
pub fn is_valid_transition(from: UpdateState, to: UpdateState) -> bool {
    use UpdateState::{
        ApplyStarted, DeploymentInProgress, DownloadStarted, DownloadSucceeded, Failed, Idle,
        InstallStarted, InstallSucceeded,
    };

    match (from, to) {
        (a, b) if a == b => true,
        (_, Idle | Failed) => true,
        (a, DownloadStarted | DeploymentInProgress | ApplyStarted) if a.is_resting() => true,

        (DownloadStarted, DownloadSucceeded) => true,
        (DeploymentInProgress, DownloadSucceeded | InstallStarted | ApplyStarted) => true,
        (DownloadSucceeded, InstallStarted | DeploymentInProgress | ApplyStarted) => true,
        (InstallStarted, InstallSucceeded) => true,
        (InstallSucceeded, ApplyStarted | InstallStarted) => true,
        // Redelivered action after an install-time restart.
        (InstallStarted, DeploymentInProgress) => true,

        _ => false,
    }
}
