//! Content handler contract and the registry of handler factories.
//!
//! The orchestrator never knows how an update type is installed; it resolves a
//! handler per node when a workflow is accepted and calls it phase by phase.
//! Tests register scripted handlers that return predetermined results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::manifest::UpdateFile;
use crate::core::result::{InstalledState, UpdateResult};

/// Cooperative cancellation shared between the orchestrator and a running handler call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything a handler receives for one call.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub workflow_id: String,
    pub update_type: String,
    pub installed_criteria: Option<String>,
    pub work_folder: PathBuf,
    /// `None` for the root node.
    pub step_index: Option<usize>,
    pub files: Vec<UpdateFile>,
    pub cancel: CancelFlag,
}

/// Operations a content handler performs for one update type.
///
/// Failures are returned as [`UpdateResult`] values; a handler never aborts the agent.
pub trait ContentHandler {
    fn download(&self, request: &HandlerRequest) -> UpdateResult;
    fn install(&self, request: &HandlerRequest) -> UpdateResult;
    fn apply(&self, request: &HandlerRequest) -> UpdateResult;
    fn cancel(&self, request: &HandlerRequest) -> UpdateResult;
    fn is_installed(&self, request: &HandlerRequest) -> InstalledState;
}

type HandlerFactory = Box<dyn Fn() -> Box<dyn ContentHandler>>;

/// Named handler factories keyed by update type (`provider/name:version`).
#[derive(Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("update_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `update_type`, replacing any previous registration.
    ///
    /// Registering without a `:version` suffix matches every version.
    pub fn register<F>(&mut self, update_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ContentHandler> + 'static,
    {
        self.factories.insert(update_type.into(), Box::new(factory));
    }

    /// Create a handler for `update_type`: exact match first, then the unversioned name.
    pub fn resolve(&self, update_type: &str) -> Option<Box<dyn ContentHandler>> {
        if let Some(factory) = self.factories.get(update_type) {
            return Some(factory());
        }
        let (name, _version) = update_type.rsplit_once(':')?;
        self.factories.get(name).map(|factory| factory())
    }
}
