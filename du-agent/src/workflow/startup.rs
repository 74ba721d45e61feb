//! Startup handling: replay of the persisted report after a reboot or restart,
//! otherwise a cold `Idle` report, followed by the startup message.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use super::{CompletedWorkflow, ResumedInstall, WorkflowContext};
use crate::core::report::patch_last_install_result;
use crate::core::result::{InstalledState, UpdateResult, codes, erc};
use crate::core::state::UpdateState;
use crate::io::content_handler::HandlerRequest;
use crate::io::persistence::{PersistedSnapshot, SnapshotPhase};
use crate::io::transport::startup_message;

impl WorkflowContext {
    /// Handle a (re)connection to the cloud.
    ///
    /// The first call without a workflow runs startup handling. Every call sends the
    /// startup message; returns whether it was sent.
    pub fn on_connected(&mut self, device_properties: &Map<String, Value>) -> bool {
        if !self.startup_done && self.active.is_none() {
            self.startup_done = true;
            if !self.resume_from_snapshot() {
                self.report_state(UpdateState::Idle, None);
            }
        }

        let message = startup_message(device_properties, &self.options.compat_property_names);
        let sent = self.send_patch(&self.options.names.agent_patch(message));
        if !sent {
            warn!("startup message not sent");
        }
        sent
    }

    /// Send the report persisted before the process ended.
    ///
    /// No phase handler is re-invoked. After an apply, the outcome comes from the
    /// handler's installed check and the workflow counts as completed. After an
    /// install-time restart, the persisted progress report is sent as is and the
    /// step results are kept for the redelivered action. Returns `false` when there
    /// is no usable snapshot.
    #[instrument(skip_all)]
    pub fn resume_from_snapshot(&mut self) -> bool {
        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "snapshot unreadable, starting cold");
                return false;
            }
        };
        info!(
            workflow_id = %snapshot.workflow_id,
            update_type = %snapshot.update_type,
            phase = ?snapshot.phase,
            "resuming workflow"
        );

        let document = match snapshot.phase {
            SnapshotPhase::Apply => self.apply_outcome_report(&snapshot),
            SnapshotPhase::Install => serde_json::from_str::<Value>(&snapshot.reporting_json)
                .context("parse persisted report"),
        };
        let document = match document {
            Ok(document) => document,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "persisted report unusable, starting cold");
                if let Err(err) = self.store.clear() {
                    warn!(err = %format!("{err:#}"), "failed to clear snapshot");
                }
                return false;
            }
        };

        let state = document
            .get("state")
            .and_then(Value::as_i64)
            .and_then(UpdateState::from_code)
            .unwrap_or(UpdateState::Idle);
        match snapshot.phase {
            SnapshotPhase::Apply => {
                self.completed = Some(CompletedWorkflow {
                    id: snapshot.workflow_id.clone(),
                    retry_timestamp: document
                        .pointer("/workflow/retryTimestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
            SnapshotPhase::Install => {
                self.resumed_install = Some(ResumedInstall {
                    id: snapshot.workflow_id.clone(),
                    step_results: snapshot.step_results.clone(),
                });
            }
        }
        self.state = state;
        self.snapshot = Some(snapshot);

        if self.send_patch(&self.options.names.agent_patch(document)) {
            info!(state = ?state, "resume report sent");
            self.last_reported_state = state;
            self.clear_snapshot();
        } else {
            warn!("resume report not sent, snapshot kept for next start");
            self.snapshot = None;
        }
        true
    }

    /// Persisted apply report patched with the installed check's outcome.
    ///
    /// `installedUpdateId` is added only when the update is confirmed installed.
    fn apply_outcome_report(&self, snapshot: &PersistedSnapshot) -> Result<Value> {
        let result = self.installed_result(snapshot);
        info!(
            result_code = result.result_code,
            extended_result_code = result.extended_result_code,
            "installed check finished"
        );
        let mut document = patch_last_install_result(&snapshot.reporting_json, &result)?;
        if result.result_code == codes::APPLY_SUCCESS
            && let Some(update_id) = &snapshot.installed_update_id
            && let Some(object) = document.as_object_mut()
        {
            object.insert(
                "installedUpdateId".to_string(),
                Value::String(update_id.clone()),
            );
        }
        Ok(document)
    }

    fn installed_result(&self, snapshot: &PersistedSnapshot) -> UpdateResult {
        let Some(handler) = self.registry.resolve(&snapshot.update_type) else {
            warn!(update_type = %snapshot.update_type, "no handler for resumed workflow");
            return UpdateResult::failure(erc::HANDLER_NOT_FOUND)
                .with_details(format!("no content handler for '{}'", snapshot.update_type));
        };
        let request = HandlerRequest {
            workflow_id: snapshot.workflow_id.clone(),
            update_type: snapshot.update_type.clone(),
            installed_criteria: snapshot.installed_criteria.clone(),
            work_folder: snapshot.work_folder.clone(),
            step_index: None,
            files: Vec::new(),
            cancel: self.cancel.clone(),
        };
        match handler.is_installed(&request) {
            InstalledState::Installed => UpdateResult::new(codes::APPLY_SUCCESS, 0),
            InstalledState::NotInstalled => UpdateResult::failure(erc::RESUME_NOT_INSTALLED),
            InstalledState::Indeterminate => UpdateResult::failure(erc::RESUME_INDETERMINATE),
        }
    }
}
