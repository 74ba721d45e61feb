//! Workflow tree: one root node for the deployment, one child per step.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]; parents hold the
//! index list of their children. The shape is fixed once the tree is built
//! from a manifest, only result fields change afterwards.

use std::path::{Path, PathBuf};

use crate::core::action::UpdateAction;
use crate::core::manifest::{ActionRequest, UpdateFile, UpdateManifest};
use crate::core::result::{UpdateResult, codes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowNode {
    id: String,
    action: UpdateAction,
    retry_timestamp: Option<String>,
    result: UpdateResult,
    result_details: Option<String>,
    update_type: String,
    installed_criteria: Option<String>,
    work_folder: PathBuf,
    update_id: Option<String>,
    files: Vec<UpdateFile>,
    children: Vec<NodeId>,
}

impl WorkflowNode {
    fn new(id: &str, action: UpdateAction, update_type: &str, work_folder: &Path) -> Self {
        Self {
            id: id.to_string(),
            action,
            retry_timestamp: None,
            result: UpdateResult::not_started(),
            result_details: None,
            update_type: update_type.to_string(),
            installed_criteria: None,
            work_folder: work_folder.to_path_buf(),
            update_id: None,
            files: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn action(&self) -> UpdateAction {
        self.action
    }

    pub fn set_action(&mut self, action: UpdateAction) {
        self.action = action;
    }

    pub fn retry_timestamp(&self) -> Option<&str> {
        self.retry_timestamp.as_deref()
    }

    pub fn set_retry_timestamp(&mut self, retry_timestamp: Option<String>) {
        self.retry_timestamp = retry_timestamp;
    }

    /// Stored result; [`UpdateResult::not_started`] until a handler has run.
    pub fn result(&self) -> &UpdateResult {
        &self.result
    }

    /// Store `result`, carrying its details over to the node's result details.
    pub fn set_result(&mut self, result: UpdateResult) {
        self.result_details = result.result_details.clone();
        self.result = result;
    }

    /// A handler ran for this node and reported success.
    pub fn has_succeeded(&self) -> bool {
        self.result.is_success() && self.result.result_code != codes::NOT_STARTED
    }

    pub fn result_details(&self) -> Option<&str> {
        self.result_details.as_deref()
    }

    pub fn set_result_details(&mut self, details: Option<String>) {
        self.result_details = details;
    }

    pub fn update_type(&self) -> &str {
        &self.update_type
    }

    pub fn installed_criteria(&self) -> Option<&str> {
        self.installed_criteria.as_deref()
    }

    pub fn work_folder(&self) -> &Path {
        &self.work_folder
    }

    pub fn update_id(&self) -> Option<&str> {
        self.update_id.as_deref()
    }

    pub fn files(&self) -> &[UpdateFile] {
        &self.files
    }
}

/// Arena of workflow nodes; index 0 is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTree {
    nodes: Vec<WorkflowNode>,
}

impl WorkflowTree {
    /// Build the tree for `request` from its parsed manifest.
    ///
    /// Every node shares the work folder `<work_folder_root>/<workflow id>`.
    pub fn from_request(
        request: &ActionRequest,
        manifest: &UpdateManifest,
        work_folder_root: &Path,
    ) -> Self {
        let work_folder = work_folder_root.join(&request.workflow_id);
        let mut root = WorkflowNode::new(
            &request.workflow_id,
            request.action,
            &manifest.update_type,
            &work_folder,
        );
        root.retry_timestamp = request.retry_timestamp.clone();
        root.installed_criteria = manifest.installed_criteria.clone();
        root.update_id = manifest.update_id.clone();
        root.files = manifest.files.clone();

        let mut tree = Self { nodes: vec![root] };
        for step in &manifest.steps {
            let mut child = WorkflowNode::new(
                &request.workflow_id,
                request.action,
                &step.update_type,
                &work_folder,
            );
            child.installed_criteria = step.installed_criteria.clone();
            child.files = step.files.clone();
            tree.push_child(child);
        }
        tree
    }

    /// A root-only tree, used when the manifest could not be parsed.
    pub fn bare(request: &ActionRequest, work_folder_root: &Path) -> Self {
        let mut root = WorkflowNode::new(
            &request.workflow_id,
            request.action,
            "",
            &work_folder_root.join(&request.workflow_id),
        );
        root.retry_timestamp = request.retry_timestamp.clone();
        Self { nodes: vec![root] }
    }

    fn push_child(&mut self, child: WorkflowNode) {
        let id = NodeId(self.nodes.len());
        self.nodes.push(child);
        self.nodes[0].children.push(id);
    }

    pub fn root(&self) -> &WorkflowNode {
        &self.nodes[0]
    }

    pub fn root_mut(&mut self) -> &mut WorkflowNode {
        &mut self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&WorkflowNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn id(&self) -> &str {
        self.root().id()
    }

    /// Number of steps under the root.
    pub fn child_count(&self) -> usize {
        self.root().children.len()
    }

    pub fn child_id(&self, index: usize) -> Option<NodeId> {
        self.root().children.get(index).copied()
    }

    pub fn child(&self, index: usize) -> Option<&WorkflowNode> {
        self.child_id(index).and_then(|id| self.node(id))
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut WorkflowNode> {
        let id = self.child_id(index)?;
        self.node_mut(id)
    }

    pub fn children(&self) -> impl Iterator<Item = &WorkflowNode> + '_ {
        self.root()
            .children
            .iter()
            .filter_map(move |id| self.nodes.get(id.0))
    }

    /// All node ids, root first then steps in order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn result(&self) -> &UpdateResult {
        self.root().result()
    }

    pub fn set_result(&mut self, result: UpdateResult) {
        self.root_mut().set_result(result);
    }

    /// Merge a same-id action into this tree, keeping step results.
    pub fn merge_retry(&mut self, action: UpdateAction, retry_timestamp: Option<String>) {
        for node in &mut self.nodes {
            node.action = action;
        }
        self.root_mut().retry_timestamp = retry_timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::ManifestStep;
    use crate::core::result::codes;
    use std::collections::BTreeMap;

    fn request(id: &str) -> ActionRequest {
        ActionRequest {
            action: UpdateAction::Install,
            workflow_id: id.to_string(),
            retry_timestamp: None,
            manifest: None,
            file_urls: BTreeMap::new(),
        }
    }

    fn manifest(step_types: &[&str]) -> UpdateManifest {
        UpdateManifest {
            update_id: Some("{\"name\":\"toaster\"}".to_string()),
            update_type: "contoso/steps:1".to_string(),
            installed_criteria: Some("1.0".to_string()),
            steps: step_types
                .iter()
                .map(|t| ManifestStep {
                    update_type: (*t).to_string(),
                    installed_criteria: None,
                    files: Vec::new(),
                })
                .collect(),
            files: Vec::new(),
        }
    }

    #[test]
    fn builds_root_and_ordered_children() {
        let tree = WorkflowTree::from_request(
            &request("wf-1"),
            &manifest(&["a/one:1", "a/two:1"]),
            Path::new("/var/lib/du/downloads"),
        );

        assert_eq!(tree.id(), "wf-1");
        assert_eq!(tree.child_count(), 2);
        assert_eq!(tree.child(0).map(|c| c.update_type()), Some("a/one:1"));
        assert_eq!(tree.child(1).map(|c| c.update_type()), Some("a/two:1"));
        assert!(tree.child(2).is_none());
        assert_eq!(
            tree.root().work_folder(),
            Path::new("/var/lib/du/downloads/wf-1")
        );
        assert_eq!(tree.node_ids().count(), 3);
    }

    #[test]
    fn results_default_to_not_started() {
        let tree = WorkflowTree::from_request(
            &request("wf-1"),
            &manifest(&["a/one:1"]),
            Path::new("/tmp"),
        );
        assert_eq!(tree.result().result_code, codes::NOT_STARTED);
        assert_eq!(
            tree.child(0).map(|c| c.result().result_code),
            Some(codes::NOT_STARTED)
        );
    }

    #[test]
    fn child_results_are_independent_of_root() {
        let mut tree = WorkflowTree::from_request(
            &request("wf-1"),
            &manifest(&["a/one:1", "a/two:1"]),
            Path::new("/tmp"),
        );
        tree.child_mut(1)
            .expect("child")
            .set_result(UpdateResult::failure(9).with_details("disk full"));

        assert_eq!(tree.result().result_code, codes::NOT_STARTED);
        assert_eq!(
            tree.child(0).map(|c| c.result().result_code),
            Some(codes::NOT_STARTED)
        );
        assert_eq!(
            tree.child(1).and_then(|c| c.result_details()),
            Some("disk full")
        );
    }

    #[test]
    fn merge_retry_keeps_step_results() {
        let mut tree = WorkflowTree::from_request(
            &request("wf-1"),
            &manifest(&["a/one:1"]),
            Path::new("/tmp"),
        );
        tree.child_mut(0)
            .expect("child")
            .set_result(UpdateResult::new(codes::INSTALL_SUCCESS, 0));

        tree.merge_retry(UpdateAction::ProcessDeployment, Some("t2".to_string()));

        assert_eq!(tree.root().retry_timestamp(), Some("t2"));
        assert_eq!(tree.root().action(), UpdateAction::ProcessDeployment);
        assert_eq!(
            tree.child(0).map(|c| c.result().result_code),
            Some(codes::INSTALL_SUCCESS)
        );
    }
}
