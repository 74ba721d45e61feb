//! Test doubles for the orchestrator's collaborators.
//!
//! Doubles share their recorded state through `Arc`s so a test keeps a handle
//! after moving the double into a [`WorkflowContext`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::result::{InstalledState, UpdateResult, codes};
use crate::io::content_handler::{ContentHandler, HandlerRegistry, HandlerRequest};
use crate::io::persistence::{FileSnapshotStore, PersistedSnapshot, SnapshotStore};
use crate::io::process::{AgentRestarter, Rebooter};
use crate::io::transport::ReportSender;
use crate::workflow::{Capabilities, WorkflowContext, WorkflowOptions};

/// Update type every scripted manifest uses.
pub const UPDATE_TYPE: &str = "contoso/fw:1";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of handler and process calls, e.g. `"install step_1"`, `"reboot"`.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        lock(&self.0).push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.0)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

/// Content handler returning predetermined results; every call is logged.
///
/// Defaults to success for every phase and `Installed` for the installed check.
/// When watching a path, `apply` records whether the file existed at call time.
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    log: CallLog,
    watch: Option<PathBuf>,
    saw_watched_file: Arc<AtomicBool>,
    download: UpdateResult,
    install: UpdateResult,
    install_steps: BTreeMap<usize, UpdateResult>,
    apply: UpdateResult,
    cancel: UpdateResult,
    installed: InstalledState,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self {
            log: CallLog::default(),
            watch: None,
            saw_watched_file: Arc::new(AtomicBool::new(false)),
            download: UpdateResult::new(codes::DOWNLOAD_SUCCESS, 0),
            install: UpdateResult::new(codes::INSTALL_SUCCESS, 0),
            install_steps: BTreeMap::new(),
            apply: UpdateResult::new(codes::APPLY_SUCCESS, 0),
            cancel: UpdateResult::new(codes::CANCEL_SUCCESS, 0),
            installed: InstalledState::Installed,
        }
    }
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn watching(mut self, path: &Path) -> Self {
        self.watch = Some(path.to_path_buf());
        self
    }

    /// Whether the watched file existed during the last `apply`.
    pub fn saw_watched_file(&self) -> bool {
        self.saw_watched_file.load(Ordering::SeqCst)
    }

    pub fn with_download(mut self, result: UpdateResult) -> Self {
        self.download = result;
        self
    }

    /// Result for root installs and for steps without a step-specific result.
    pub fn with_install(mut self, result: UpdateResult) -> Self {
        self.install = result;
        self
    }

    pub fn with_step_install(mut self, step: usize, result: UpdateResult) -> Self {
        self.install_steps.insert(step, result);
        self
    }

    pub fn with_apply(mut self, result: UpdateResult) -> Self {
        self.apply = result;
        self
    }

    pub fn with_installed(mut self, installed: InstalledState) -> Self {
        self.installed = installed;
        self
    }

    /// Registry resolving [`UPDATE_TYPE`] to clones of this handler.
    pub fn registry(self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(UPDATE_TYPE, move || Box::new(self.clone()));
        registry
    }

    fn record(&self, op: &str, request: &HandlerRequest) {
        let target = request
            .step_index
            .map_or_else(|| "root".to_string(), |index| format!("step_{index}"));
        self.log.record(format!("{op} {target}"));
    }
}

impl ContentHandler for ScriptedHandler {
    fn download(&self, request: &HandlerRequest) -> UpdateResult {
        self.record("download", request);
        self.download.clone()
    }

    fn install(&self, request: &HandlerRequest) -> UpdateResult {
        self.record("install", request);
        request
            .step_index
            .and_then(|index| self.install_steps.get(&index))
            .unwrap_or(&self.install)
            .clone()
    }

    fn apply(&self, request: &HandlerRequest) -> UpdateResult {
        self.record("apply", request);
        if let Some(path) = &self.watch {
            self.saw_watched_file.store(path.exists(), Ordering::SeqCst);
        }
        self.apply.clone()
    }

    fn cancel(&self, request: &HandlerRequest) -> UpdateResult {
        self.record("cancel", request);
        self.cancel.clone()
    }

    fn is_installed(&self, request: &HandlerRequest) -> InstalledState {
        self.record("is_installed", request);
        self.installed
    }
}

/// Report sender that keeps every payload it was given.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject (and do not record) sends while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn payloads(&self) -> Vec<Value> {
        lock(&self.sent)
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect()
    }

    /// Agent documents (`deviceUpdate.agent`) in send order, startup messages included.
    pub fn agent_reports(&self) -> Vec<Value> {
        self.payloads()
            .into_iter()
            .filter_map(|payload| payload.pointer("/deviceUpdate/agent").cloned())
            .collect()
    }

    /// Agent documents carrying a `state`, in send order.
    pub fn state_reports(&self) -> Vec<Value> {
        self.agent_reports()
            .into_iter()
            .filter(|report| report.get("state").is_some())
            .collect()
    }

    pub fn states(&self) -> Vec<i64> {
        self.state_reports()
            .iter()
            .filter_map(|report| report["state"].as_i64())
            .collect()
    }

    pub fn last_state_report(&self) -> Option<Value> {
        self.state_reports().pop()
    }

    /// Acknowledgements (`deviceUpdate.service`) in send order.
    pub fn acks(&self) -> Vec<Value> {
        self.payloads()
            .into_iter()
            .filter_map(|payload| payload.pointer("/deviceUpdate/service").cloned())
            .collect()
    }
}

impl ReportSender for RecordingSender {
    fn send(&self, payload: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("transport unavailable");
        }
        lock(&self.sent).push(payload.to_string());
        Ok(())
    }
}

/// Rebooter and restarter double counting invocations.
///
/// When watching a path, it records whether the file existed at call time.
#[derive(Debug, Clone, Default)]
pub struct CountingProcess {
    calls: Arc<AtomicUsize>,
    failing: bool,
    watch: Option<PathBuf>,
    saw_watched_file: Arc<AtomicBool>,
    log: Option<CallLog>,
}

impl CountingProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn watching(mut self, path: &Path) -> Self {
        self.watch = Some(path.to_path_buf());
        self
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn saw_watched_file(&self) -> bool {
        self.saw_watched_file.load(Ordering::SeqCst)
    }

    fn invoke(&self, name: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.record(name);
        }
        if let Some(path) = &self.watch {
            self.saw_watched_file.store(path.exists(), Ordering::SeqCst);
        }
        if self.failing {
            return Err(anyhow!("{name} refused"));
        }
        Ok(())
    }
}

impl Rebooter for CountingProcess {
    fn reboot(&self) -> Result<()> {
        self.invoke("reboot")
    }
}

impl AgentRestarter for CountingProcess {
    fn restart_agent(&self) -> Result<()> {
        self.invoke("restart")
    }
}

/// Snapshot store whose writes always fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

impl SnapshotStore for FailingStore {
    fn load(&self) -> Result<Option<PersistedSnapshot>> {
        Ok(None)
    }

    fn save(&self, _snapshot: &PersistedSnapshot) -> Result<()> {
        bail!("disk full")
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// A workflow context wired to doubles inside a temp directory.
pub struct Harness {
    pub temp: TempDir,
    pub log: CallLog,
    pub sender: RecordingSender,
    pub rebooter: CountingProcess,
    pub restarter: CountingProcess,
    pub context: WorkflowContext,
}

impl Harness {
    pub fn new(handler: ScriptedHandler) -> Result<Self> {
        Self::build(handler, |options| options, None)
    }

    /// Build with adjusted options and, optionally, a replacement snapshot store.
    pub fn build(
        handler: ScriptedHandler,
        configure: impl FnOnce(WorkflowOptions) -> WorkflowOptions,
        store: Option<Box<dyn SnapshotStore>>,
    ) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let log = handler.log();
        let sender = RecordingSender::new();
        let snapshot_path = snapshot_path(temp.path());
        let rebooter = CountingProcess::new()
            .watching(&snapshot_path)
            .with_log(&log);
        let restarter = CountingProcess::new()
            .watching(&snapshot_path)
            .with_log(&log);
        Self::assemble(temp, handler, configure, store, sender, rebooter, restarter)
    }

    /// Build with caller-provided process doubles.
    pub fn with_processes(
        handler: ScriptedHandler,
        rebooter: CountingProcess,
        restarter: CountingProcess,
    ) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        Self::assemble(
            temp,
            handler,
            |options| options,
            None,
            RecordingSender::new(),
            rebooter,
            restarter,
        )
    }

    fn assemble(
        temp: TempDir,
        handler: ScriptedHandler,
        configure: impl FnOnce(WorkflowOptions) -> WorkflowOptions,
        store: Option<Box<dyn SnapshotStore>>,
        sender: RecordingSender,
        rebooter: CountingProcess,
        restarter: CountingProcess,
    ) -> Result<Self> {
        let handler = handler.watching(&snapshot_path(temp.path()));
        let log = handler.log();
        let options = configure(WorkflowOptions {
            work_folder_root: temp.path().join("downloads"),
            ..WorkflowOptions::default()
        });
        let store =
            store.unwrap_or_else(|| Box::new(FileSnapshotStore::new(snapshot_path(temp.path()))));
        let context = WorkflowContext::new(
            options,
            Capabilities {
                sender: Box::new(sender.clone()),
                rebooter: Box::new(rebooter.clone()),
                restarter: Box::new(restarter.clone()),
                store,
                registry: handler.registry(),
            },
        );
        Ok(Self {
            temp,
            log,
            sender,
            rebooter,
            restarter,
            context,
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        snapshot_path(self.temp.path())
    }

    pub fn store(&self) -> FileSnapshotStore {
        FileSnapshotStore::new(self.snapshot_path())
    }
}

pub fn snapshot_path(root: &Path) -> PathBuf {
    root.join("state").join("snapshot.json")
}

/// Manifest with `steps` steps, all handled by [`UPDATE_TYPE`].
pub fn manifest(steps: usize) -> Value {
    let steps: Vec<Value> = (0..steps)
        .map(|index| {
            json!({
                "handler": UPDATE_TYPE,
                "handlerProperties": { "installedCriteria": format!("step-{index}") }
            })
        })
        .collect();
    json!({
        "updateId": { "provider": "contoso", "name": "toaster", "version": "1.0" },
        "updateType": UPDATE_TYPE,
        "installedCriteria": "1.0",
        "instructions": { "steps": steps },
        "files": {}
    })
}

/// Nested-form action payload with a string-encoded manifest.
pub fn action_payload(action: i32, workflow_id: &str, steps: usize) -> Value {
    json!({
        "workflow": { "action": action, "id": workflow_id },
        "updateManifest": manifest(steps).to_string(),
        "updateManifestSignature": "eyJhbGciOi...",
        "fileUrls": {}
    })
}

pub fn deployment_payload(workflow_id: &str, steps: usize) -> Value {
    action_payload(3, workflow_id, steps)
}

pub fn cancel_payload(workflow_id: &str) -> Value {
    json!({ "workflow": { "action": 255, "id": workflow_id } })
}

/// The installed update id reported for [`manifest`].
pub fn expected_update_id() -> String {
    json!({ "provider": "contoso", "name": "toaster", "version": "1.0" }).to_string()
}
