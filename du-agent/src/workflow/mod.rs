//! Workflow orchestration: the update state machine.
//!
//! A [`WorkflowContext`] is created once per process. Cloud actions enter through
//! [`WorkflowContext::handle_action`]; handler calls happen only in
//! [`WorkflowContext::do_work`], one per tick, so a second handler call never
//! starts before the previous result is recorded and reported.
//!
//! Phase plan per action:
//!
//! ```text
//! Download           DownloadStarted -> download(root) -> DownloadSucceeded | Failed
//! Install/Deploy     DeploymentInProgress -> [download(root)] -> install(step i)...
//!                    -> ApplyStarted -> persist -> apply(root) -> Idle | Failed
//! Apply              ApplyStarted -> persist -> apply(root)   (install must have succeeded)
//! Cancel             cancel(root) -> pending steps cancelled -> Idle
//! ```

mod startup;

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::action::UpdateAction;
use crate::core::manifest::{ActionRequest, UpdateManifest, parse_action};
use crate::core::report::build_report;
use crate::core::result::{RestartKind, RestartRequest, UpdateResult, codes, erc};
use crate::core::state::{UpdateState, is_valid_transition};
use crate::io::config::AgentConfig;
use crate::io::content_handler::{CancelFlag, ContentHandler, HandlerRegistry, HandlerRequest};
use crate::io::persistence::{PersistedSnapshot, SnapshotPhase, SnapshotStore};
use crate::io::process::{AgentRestarter, Rebooter};
use crate::io::transport::{PropertyNames, ReportSender};
use crate::tree::{NodeId, WorkflowNode, WorkflowTree};

/// Settings the orchestrator reads from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOptions {
    pub names: PropertyNames,
    pub work_folder_root: PathBuf,
    pub compat_property_names: String,
    pub report_intermediate_states: bool,
}

impl From<&AgentConfig> for WorkflowOptions {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            names: PropertyNames {
                component: cfg.component_name.clone(),
                agent: cfg.agent_property.clone(),
                service: cfg.service_property.clone(),
            },
            work_folder_root: cfg.work_folder_root.clone(),
            compat_property_names: cfg.compat_property_names.clone(),
            report_intermediate_states: cfg.report_intermediate_states,
        }
    }
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// Collaborators injected into the orchestrator.
pub struct Capabilities {
    pub sender: Box<dyn ReportSender>,
    pub rebooter: Box<dyn Rebooter>,
    pub restarter: Box<dyn AgentRestarter>,
    pub store: Box<dyn SnapshotStore>,
    pub registry: HandlerRegistry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Download,
    /// `None` installs the root of a workflow without steps.
    Install(Option<usize>),
    Apply,
}

struct ActiveWorkflow {
    tree: WorkflowTree,
    /// One handler per node, indexed like the tree arena. Empty when resolution failed.
    handlers: Vec<Box<dyn ContentHandler>>,
    plan: VecDeque<Phase>,
    downloaded: bool,
    installed: bool,
    /// Deferred reboot/restart asked for by an install, honoured after apply.
    pending_restart: Option<RestartRequest>,
    finished: bool,
}

impl ActiveWorkflow {
    fn new(tree: WorkflowTree) -> Self {
        Self {
            tree,
            handlers: Vec::new(),
            plan: VecDeque::new(),
            downloaded: false,
            installed: false,
            pending_restart: None,
            finished: false,
        }
    }

    fn has_handlers(&self) -> bool {
        !self.handlers.is_empty() && self.handlers.len() == self.tree.node_ids().count()
    }

    fn request(&self, node: NodeId, cancel: &CancelFlag) -> HandlerRequest {
        let step_index = (node != NodeId::ROOT).then(|| node.index() - 1);
        let root = self.tree.root();
        let target = self.tree.node(node).unwrap_or(root);
        HandlerRequest {
            workflow_id: root.id().to_string(),
            update_type: target.update_type().to_string(),
            installed_criteria: target.installed_criteria().map(str::to_string),
            work_folder: target.work_folder().to_path_buf(),
            step_index,
            files: target.files().to_vec(),
            cancel: cancel.clone(),
        }
    }

    fn plan_for(&self, action: UpdateAction) -> VecDeque<Phase> {
        let mut plan = VecDeque::new();
        match action {
            UpdateAction::Download => plan.push_back(Phase::Download),
            UpdateAction::Install | UpdateAction::ProcessDeployment => {
                if !self.downloaded {
                    plan.push_back(Phase::Download);
                }
                if self.tree.child_count() == 0 {
                    if !self.installed {
                        plan.push_back(Phase::Install(None));
                    }
                } else {
                    for (index, step) in self.tree.children().enumerate() {
                        if !step.has_succeeded() {
                            plan.push_back(Phase::Install(Some(index)));
                        }
                    }
                }
                plan.push_back(Phase::Apply);
            }
            UpdateAction::Apply => plan.push_back(Phase::Apply),
            UpdateAction::Cancel => {}
        }
        plan
    }
}

/// Id and retry marker of a workflow finished by a resume report.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompletedWorkflow {
    id: String,
    retry_timestamp: Option<String>,
}

/// Step results of a workflow interrupted by an install-time restart.
///
/// Restored when the cloud redelivers the action, so only the pending steps run.
#[derive(Debug, Clone, PartialEq)]
struct ResumedInstall {
    id: String,
    step_results: Vec<UpdateResult>,
}

/// Process-scoped orchestrator state.
pub struct WorkflowContext {
    options: WorkflowOptions,
    sender: Box<dyn ReportSender>,
    rebooter: Box<dyn Rebooter>,
    restarter: Box<dyn AgentRestarter>,
    store: Box<dyn SnapshotStore>,
    registry: HandlerRegistry,

    active: Option<ActiveWorkflow>,
    deferred: Option<ActionRequest>,
    completed: Option<CompletedWorkflow>,
    resumed_install: Option<ResumedInstall>,
    state: UpdateState,
    last_reported_state: UpdateState,
    snapshot: Option<PersistedSnapshot>,
    cancel: CancelFlag,
    restart_requested: bool,
    startup_done: bool,
}

impl WorkflowContext {
    pub fn new(options: WorkflowOptions, capabilities: Capabilities) -> Self {
        Self {
            options,
            sender: capabilities.sender,
            rebooter: capabilities.rebooter,
            restarter: capabilities.restarter,
            store: capabilities.store,
            registry: capabilities.registry,
            active: None,
            deferred: None,
            completed: None,
            resumed_install: None,
            state: UpdateState::Idle,
            last_reported_state: UpdateState::Idle,
            snapshot: None,
            cancel: CancelFlag::new(),
            restart_requested: false,
            startup_done: false,
        }
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Current state of the machine, whether or not it was sent.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn last_reported_state(&self) -> UpdateState {
        self.last_reported_state
    }

    pub fn tree(&self) -> Option<&WorkflowTree> {
        self.active.as_ref().map(|active| &active.tree)
    }

    pub fn active_workflow_id(&self) -> Option<&str> {
        self.tree().map(WorkflowTree::id)
    }

    /// A workflow is accepted and its terminal report has not been sent.
    pub fn is_in_flight(&self) -> bool {
        self.active.as_ref().is_some_and(|active| !active.finished)
    }

    pub fn deferred_workflow_id(&self) -> Option<&str> {
        self.deferred
            .as_ref()
            .map(|request| request.workflow_id.as_str())
    }

    /// A reboot or agent restart was invoked; the process is expected to end.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Parse a raw cloud-to-device action and accept it.
    ///
    /// Malformed payloads are logged and ignored; returns whether it was accepted.
    pub fn handle_action(&mut self, payload: &Value) -> bool {
        match parse_action(payload) {
            Ok(request) => {
                self.accept(request);
                true
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring malformed update action");
                false
            }
        }
    }

    /// Route a parsed action: start, merge, defer, cancel or ignore it.
    pub fn accept(&mut self, request: ActionRequest) {
        info!(workflow_id = %request.workflow_id, action = ?request.action, "update action received");

        if request.action == UpdateAction::Cancel {
            self.cancel_workflow(&request.workflow_id);
            return;
        }
        if self.restart_requested {
            warn!(workflow_id = %request.workflow_id, "restart pending, deferring action");
            self.deferred = Some(request);
            return;
        }

        let Some(active) = self.active.as_ref() else {
            if self.is_completed_duplicate(&request) {
                debug!(workflow_id = %request.workflow_id, "workflow already completed, ignoring");
                return;
            }
            self.start(request);
            return;
        };

        if active.tree.id() != request.workflow_id {
            if active.finished {
                self.start(request);
            } else {
                info!(
                    active = %active.tree.id(),
                    workflow_id = %request.workflow_id,
                    "workflow in flight, deferring action"
                );
                self.deferred = Some(request);
            }
            return;
        }

        if !active.has_handlers() || step_count_changed(&active.tree, &request) {
            info!(workflow_id = %request.workflow_id, "replacing workflow tree");
            self.start(request);
            return;
        }

        let root = active.tree.root();
        if root.action() == request.action
            && root.retry_timestamp() == request.retry_timestamp.as_deref()
        {
            debug!(workflow_id = %request.workflow_id, "duplicate update action ignored");
            return;
        }
        self.merge(request);
    }

    /// Run at most one handler call, or accept a deferred action.
    ///
    /// Returns `false` when there was nothing to do.
    pub fn do_work(&mut self) -> bool {
        if self.restart_requested {
            return false;
        }
        let phase = self
            .active
            .as_mut()
            .filter(|active| !active.finished)
            .and_then(|active| active.plan.pop_front());
        if let Some(phase) = phase {
            self.run_phase(phase);
            return true;
        }
        if !self.is_in_flight()
            && let Some(request) = self.deferred.take()
        {
            info!(workflow_id = %request.workflow_id, "accepting deferred action");
            self.accept(request);
            return true;
        }
        false
    }

    /// Drive [`Self::do_work`] until nothing is pending.
    pub fn run_until_idle(&mut self) {
        while self.do_work() {}
    }

    /// Send a report for `state`; `result` overrides the root result when given.
    pub fn report_state(&mut self, state: UpdateState, result: Option<&UpdateResult>) -> bool {
        self.send_report(state, result, None, false)
    }

    /// Serialize and send a reported-property patch. Failures are logged.
    pub fn send_patch(&self, patch: &Value) -> bool {
        let payload = match serde_json::to_string(patch) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(err = %err, "failed to serialize reported property");
                return false;
            }
        };
        match self.sender.send(&payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "reported property not sent");
                false
            }
        }
    }

    fn send_report(
        &mut self,
        state: UpdateState,
        result: Option<&UpdateResult>,
        installed_update_id: Option<&str>,
        terminal: bool,
    ) -> bool {
        if !is_valid_transition(self.state, state) {
            warn!(from = ?self.state, to = ?state, "unexpected state transition");
        }
        self.state = state;

        if !terminal && state.is_intermediate() && !self.options.report_intermediate_states {
            debug!(state = ?state, "intermediate state not reported");
            return true;
        }
        if state == UpdateState::DeploymentInProgress
            && result.is_none()
            && let Some(active) = self.active.as_mut()
        {
            active
                .tree
                .set_result(UpdateResult::new(codes::DEPLOYMENT_IN_PROGRESS, 0));
        }

        let tree = self.active.as_ref().map(|active| &active.tree);
        let document = match build_report(tree, state, result, installed_update_id).to_value() {
            Ok(document) => document,
            Err(err) => {
                warn!(err = %format!("{err:#}"), state = ?state, "report not built");
                return false;
            }
        };
        let sent = self.send_patch(&self.options.names.agent_patch(document));
        if sent {
            debug!(state = ?state, "state reported");
            self.last_reported_state = state;
        }
        sent
    }

    fn start(&mut self, request: ActionRequest) {
        self.cancel.reset();
        self.completed = None;
        let resumed = self.resumed_install.take();

        let work_root = self.options.work_folder_root.clone();
        let (tree, failure) = match request.manifest.as_ref() {
            Some(manifest) => match UpdateManifest::parse(manifest, &request.file_urls) {
                Ok(manifest) => (
                    WorkflowTree::from_request(&request, &manifest, &work_root),
                    None,
                ),
                Err(err) => (
                    WorkflowTree::bare(&request, &work_root),
                    Some(
                        UpdateResult::failure(erc::MANIFEST_INVALID)
                            .with_details(format!("{err:#}")),
                    ),
                ),
            },
            None if request.action == UpdateAction::Apply => {
                (WorkflowTree::bare(&request, &work_root), None)
            }
            None => (
                WorkflowTree::bare(&request, &work_root),
                Some(
                    UpdateResult::failure(erc::MANIFEST_INVALID)
                        .with_details("update action has no updateManifest"),
                ),
            ),
        };

        let mut active = ActiveWorkflow::new(tree);
        let failure = failure.or_else(|| {
            if request.action == UpdateAction::Apply {
                return None;
            }
            match resolve_handlers(&self.registry, &active.tree) {
                Ok(handlers) => {
                    active.handlers = handlers;
                    None
                }
                Err(result) => Some(result),
            }
        });
        if failure.is_none()
            && let Some(resumed) = resumed.filter(|resumed| {
                resumed.id == request.workflow_id
                    && resumed.step_results.len() == active.tree.child_count()
            })
        {
            info!(workflow_id = %request.workflow_id, "continuing workflow interrupted by a restart");
            for (index, result) in resumed.step_results.into_iter().enumerate() {
                if let Some(step) = active.tree.child_mut(index) {
                    step.set_result(result);
                }
            }
            active.downloaded = true;
            active.installed = active.tree.children().all(WorkflowNode::has_succeeded);
        }
        self.active = Some(active);

        if let Some(result) = failure {
            warn!(
                workflow_id = %request.workflow_id,
                extended_result_code = result.extended_result_code,
                "workflow rejected"
            );
            self.fail(result);
            return;
        }
        self.begin(request.action);
    }

    fn merge(&mut self, request: ActionRequest) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        info!(
            workflow_id = %request.workflow_id,
            retry_timestamp = ?request.retry_timestamp,
            "merging update action into active workflow"
        );
        active
            .tree
            .merge_retry(request.action, request.retry_timestamp.clone());
        active.finished = false;
        active.pending_restart = None;
        self.cancel.reset();
        self.begin(request.action);
    }

    fn begin(&mut self, action: UpdateAction) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if action == UpdateAction::Apply && !active.installed {
            self.fail(
                UpdateResult::failure(erc::APPLY_WITHOUT_INSTALL)
                    .with_details("apply requested before a successful install"),
            );
            return;
        }
        active.plan = active.plan_for(action);
        debug!(plan = ?active.plan, "workflow planned");
        match action {
            UpdateAction::Download => {
                self.report_state(UpdateState::DownloadStarted, None);
            }
            UpdateAction::Install | UpdateAction::ProcessDeployment => {
                self.report_state(UpdateState::DeploymentInProgress, None);
            }
            UpdateAction::Apply | UpdateAction::Cancel => {}
        }
    }

    #[instrument(skip_all, fields(phase = ?phase))]
    fn run_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Download => self.run_download(),
            Phase::Install(step) => self.run_install(step),
            Phase::Apply => self.run_apply(),
        }
    }

    fn run_download(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let request = active.request(NodeId::ROOT, &self.cancel);
        let result = match active.handlers.first() {
            Some(handler) => handler.download(&request),
            None => UpdateResult::failure(erc::HANDLER_NOT_FOUND),
        };
        info!(
            workflow_id = %request.workflow_id,
            result_code = result.result_code,
            extended_result_code = result.extended_result_code,
            "download finished"
        );
        active.tree.set_result(result.clone());

        if result.is_failure() {
            self.finish(UpdateState::Failed, None);
            return;
        }
        active.downloaded = true;
        if active.tree.root().action() == UpdateAction::Download {
            self.finish(UpdateState::DownloadSucceeded, None);
        } else {
            self.report_state(UpdateState::DownloadSucceeded, None);
        }
    }

    fn run_install(&mut self, step: Option<usize>) {
        if self.state != UpdateState::InstallStarted {
            self.report_state(UpdateState::InstallStarted, None);
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let node = match step {
            Some(index) => active.tree.child_id(index),
            None => Some(NodeId::ROOT),
        };
        let Some(node) = node else {
            error!(step = ?step, "install planned for a missing step");
            self.fail(UpdateResult::failure(erc::STEP_FAILED));
            return;
        };

        let request = active.request(node, &self.cancel);
        let result = match active.handlers.get(node.index()) {
            Some(handler) => handler.install(&request),
            None => UpdateResult::failure(erc::HANDLER_NOT_FOUND),
        };
        info!(
            workflow_id = %request.workflow_id,
            step = ?step,
            result_code = result.result_code,
            extended_result_code = result.extended_result_code,
            "install finished"
        );
        if let Some(target) = active.tree.node_mut(node) {
            target.set_result(result.clone());
        }

        if result.is_failure() {
            if let Some(index) = step {
                let extended = match result.extended_result_code {
                    0 => erc::STEP_FAILED,
                    code => code,
                };
                active.tree.set_result(
                    UpdateResult::failure(extended).with_details(format!("step {index} failed")),
                );
            }
            self.finish(UpdateState::Failed, None);
            return;
        }

        if let Some(restart) = result.restart_request() {
            if restart.immediate {
                info!(kind = ?restart.kind, "install requires an immediate restart");
                self.restart_now(restart.kind, SnapshotPhase::Install);
                return;
            }
            active.pending_restart = Some(strongest(active.pending_restart, restart));
        }

        if matches!(active.plan.front(), Some(Phase::Install(_))) {
            self.report_state(UpdateState::InstallStarted, None);
        } else {
            active.installed = true;
            self.report_state(UpdateState::InstallSucceeded, None);
        }
    }

    fn run_apply(&mut self) {
        self.report_state(UpdateState::ApplyStarted, None);

        if let Err(err) = self.persist_snapshot(SnapshotPhase::Apply) {
            error!(err = %format!("{err:#}"), "snapshot not persisted, apply skipped");
            self.fail(UpdateResult::failure(erc::PERSIST_FAILED).with_details(format!("{err:#}")));
            return;
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        let request = active.request(NodeId::ROOT, &self.cancel);
        let result = match active.handlers.first() {
            Some(handler) => handler.apply(&request),
            None => UpdateResult::failure(erc::HANDLER_NOT_FOUND),
        };
        info!(
            workflow_id = %request.workflow_id,
            result_code = result.result_code,
            extended_result_code = result.extended_result_code,
            "apply finished"
        );
        active.tree.set_result(result.clone());

        if result.is_failure() {
            self.clear_snapshot();
            self.finish(UpdateState::Failed, None);
            return;
        }
        if let Some(restart) = result.restart_request().or(active.pending_restart) {
            self.restart_now(restart.kind, SnapshotPhase::Apply);
            return;
        }

        let installed_update_id = active.tree.root().update_id().map(str::to_string);
        self.clear_snapshot();
        self.finish(UpdateState::Idle, installed_update_id);
    }

    /// Persist (unless already persisted) and invoke the process-ending capability.
    fn restart_now(&mut self, kind: RestartKind, phase: SnapshotPhase) {
        if self.snapshot.is_none()
            && let Err(err) = self.persist_snapshot(phase)
        {
            error!(err = %format!("{err:#}"), "snapshot not persisted, restart skipped");
            self.fail(UpdateResult::failure(erc::PERSIST_FAILED).with_details(format!("{err:#}")));
            return;
        }

        let (outcome, failure_code) = match kind {
            RestartKind::Reboot => (self.rebooter.reboot(), erc::REBOOT_FAILED),
            RestartKind::AgentRestart => (self.restarter.restart_agent(), erc::RESTART_FAILED),
        };
        match outcome {
            Ok(()) => {
                info!(kind = ?kind, "process-ending action requested");
                self.restart_requested = true;
                if let Some(active) = self.active.as_mut() {
                    active.plan.clear();
                    active.finished = true;
                }
            }
            Err(err) => {
                error!(kind = ?kind, err = %format!("{err:#}"), "process-ending action failed");
                self.clear_snapshot();
                self.fail(UpdateResult::failure(failure_code).with_details(format!("{err:#}")));
            }
        }
    }

    /// Write the snapshot describing the report expected after a restart.
    ///
    /// An apply snapshot reports `Idle` once the installed check ran; an install
    /// snapshot reports `InstallStarted` with the step results so far.
    fn persist_snapshot(&mut self, phase: SnapshotPhase) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            anyhow::bail!("no active workflow to persist");
        };
        let root = active.tree.root();
        let (state, result, step_results) = match phase {
            SnapshotPhase::Apply => (UpdateState::Idle, codes::APPLY_IN_PROGRESS, Vec::new()),
            SnapshotPhase::Install => (
                UpdateState::InstallStarted,
                codes::INSTALL_IN_PROGRESS,
                active
                    .tree
                    .children()
                    .map(|step| step.result().clone())
                    .collect(),
            ),
        };
        let reporting_json = build_report(
            Some(&active.tree),
            state,
            Some(&UpdateResult::new(result, 0)),
            None,
        )
        .to_json()?;
        let snapshot = PersistedSnapshot {
            phase,
            work_folder: root.work_folder().to_path_buf(),
            workflow_id: root.id().to_string(),
            update_type: root.update_type().to_string(),
            installed_criteria: root.installed_criteria().map(str::to_string),
            installed_update_id: root.update_id().map(str::to_string),
            step_results,
            reporting_json,
        };
        self.store.save(&snapshot)?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn clear_snapshot(&mut self) {
        if self.snapshot.take().is_some()
            && let Err(err) = self.store.clear()
        {
            warn!(err = %format!("{err:#}"), "failed to clear snapshot");
        }
    }

    fn cancel_workflow(&mut self, workflow_id: &str) {
        if self.restart_requested {
            warn!(workflow_id = %workflow_id, "restart already requested, cancel refused");
            return;
        }
        if self.deferred_workflow_id() == Some(workflow_id) {
            info!(workflow_id = %workflow_id, "deferred action cancelled");
            self.deferred = None;
            return;
        }
        let staged_download = self.state == UpdateState::DownloadSucceeded;
        let Some(active) = self.active.as_mut().filter(|active| {
            !active.finished
                || (staged_download && active.tree.root().action() == UpdateAction::Download)
        }) else {
            debug!(workflow_id = %workflow_id, "no workflow in flight, cancel ignored");
            return;
        };
        if active.tree.id() != workflow_id {
            warn!(
                active = %active.tree.id(),
                workflow_id = %workflow_id,
                "cancel for another workflow ignored"
            );
            return;
        }

        self.cancel.cancel();
        let request = active.request(NodeId::ROOT, &self.cancel);
        if let Some(handler) = active.handlers.first() {
            let result = handler.cancel(&request);
            if result.result_code != codes::CANCEL_SUCCESS {
                warn!(
                    result_code = result.result_code,
                    extended_result_code = result.extended_result_code,
                    "handler could not cancel"
                );
            }
        }
        for index in 0..active.tree.child_count() {
            if let Some(step) = active.tree.child_mut(index)
                && !step.has_succeeded()
            {
                step.set_result(UpdateResult::cancelled());
            }
        }
        active.tree.set_result(UpdateResult::cancelled());
        active.downloaded = false;
        info!(workflow_id = %workflow_id, "workflow cancelled");

        self.clear_snapshot();
        self.finish(UpdateState::Idle, None);
    }

    fn fail(&mut self, result: UpdateResult) {
        if let Some(active) = self.active.as_mut() {
            active.tree.set_result(result);
        }
        self.finish(UpdateState::Failed, None);
    }

    /// Send the terminal report for the active workflow.
    fn finish(&mut self, state: UpdateState, installed_update_id: Option<String>) {
        if let Some(active) = self.active.as_mut() {
            active.plan.clear();
            active.finished = true;
        }
        self.send_report(state, None, installed_update_id.as_deref(), true);
    }

    fn is_completed_duplicate(&self, request: &ActionRequest) -> bool {
        self.completed.as_ref().is_some_and(|completed| {
            completed.id == request.workflow_id
                && completed.retry_timestamp == request.retry_timestamp
        })
    }
}

fn step_count_changed(tree: &WorkflowTree, request: &ActionRequest) -> bool {
    request
        .manifest
        .as_ref()
        .and_then(|manifest| UpdateManifest::parse(manifest, &request.file_urls).ok())
        .is_some_and(|manifest| manifest.steps.len() != tree.child_count())
}

fn resolve_handlers(
    registry: &HandlerRegistry,
    tree: &WorkflowTree,
) -> Result<Vec<Box<dyn ContentHandler>>, UpdateResult> {
    tree.node_ids()
        .map(|id| {
            let update_type = tree.node(id).map(|node| node.update_type()).unwrap_or("");
            registry.resolve(update_type).ok_or_else(|| {
                UpdateResult::failure(erc::HANDLER_NOT_FOUND)
                    .with_details(format!("no content handler for '{update_type}'"))
            })
        })
        .collect()
}

/// A reboot outranks an agent restart.
fn strongest(current: Option<RestartRequest>, next: RestartRequest) -> RestartRequest {
    match current {
        Some(current) if current.kind == RestartKind::Reboot => current,
        _ => next,
    }
}
