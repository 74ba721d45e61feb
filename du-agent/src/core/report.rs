//! Device-to-cloud reporting document.
//!
//! Documents are derived from the workflow tree on every send, except after a
//! resume where the persisted document is reused and only its root result codes
//! are patched.

use anyhow::{Context, Result, anyhow};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::core::action::UpdateAction;
use crate::core::result::UpdateResult;
use crate::core::state::UpdateState;
use crate::tree::WorkflowTree;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingDocument {
    pub state: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_update_id: Option<String>,
    pub last_install_result: LastInstallResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    pub action: UpdateAction,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastInstallResult {
    #[serde(flatten)]
    pub result: UpdateResult,
    #[serde(skip_serializing_if = "StepResults::is_omitted")]
    pub step_results: StepResults,
}

/// The three shapes of `stepResults`: absent, explicit `null`, or a `step_<i>` map.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResults {
    Omitted,
    Cleared,
    Steps(Vec<UpdateResult>),
}

impl StepResults {
    pub fn is_omitted(&self) -> bool {
        matches!(self, StepResults::Omitted)
    }
}

impl Serialize for StepResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StepResults::Omitted | StepResults::Cleared => serializer.serialize_none(),
            StepResults::Steps(steps) => {
                let mut map = serializer.serialize_map(Some(steps.len()))?;
                for (index, result) in steps.iter().enumerate() {
                    map.serialize_entry(&step_key(index), result)?;
                }
                map.end()
            }
        }
    }
}

/// Key of the i-th step; the transport rejects `:` and `-` in structured keys.
pub fn step_key(index: usize) -> String {
    format!("step_{index}")
}

/// Build the report for `state`.
///
/// `result` overrides the root node's stored result when given. Without a tree the
/// document carries no `workflow` and a [`UpdateResult::not_started`] result.
pub fn build_report(
    tree: Option<&WorkflowTree>,
    state: UpdateState,
    result: Option<&UpdateResult>,
    installed_update_id: Option<&str>,
) -> ReportingDocument {
    let root_result = match (result, tree) {
        (Some(result), _) => result.clone(),
        (None, Some(tree)) => node_result(tree.result(), tree.root().result_details()),
        (None, None) => UpdateResult::not_started(),
    };

    let step_results = match tree {
        _ if state.clears_step_results() => StepResults::Cleared,
        Some(tree) if tree.child_count() > 0 => StepResults::Steps(
            tree.children()
                .map(|child| node_result(child.result(), child.result_details()))
                .collect(),
        ),
        _ => StepResults::Omitted,
    };

    ReportingDocument {
        state,
        workflow: tree.map(|tree| WorkflowReport {
            action: tree.root().action(),
            id: tree.id().to_string(),
            retry_timestamp: tree.root().retry_timestamp().map(str::to_string),
        }),
        installed_update_id: installed_update_id.map(str::to_string),
        last_install_result: LastInstallResult {
            result: root_result,
            step_results,
        },
    }
}

fn node_result(result: &UpdateResult, details: Option<&str>) -> UpdateResult {
    UpdateResult {
        result_details: details.map(str::to_string),
        ..result.clone()
    }
}

impl ReportingDocument {
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("serialize reporting document")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize reporting document")
    }
}

/// Overwrite `lastInstallResult.resultCode`/`extendedResultCode` of a persisted document.
///
/// Every other field, including `resultDetails` and `stepResults`, is kept verbatim.
pub fn patch_last_install_result(document: &str, result: &UpdateResult) -> Result<Value> {
    let mut value: Value = serde_json::from_str(document).context("parse persisted report")?;
    let root = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("persisted report is not a JSON object"))?;
    let last = root
        .entry("lastInstallResult")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let last = last
        .as_object_mut()
        .ok_or_else(|| anyhow!("persisted lastInstallResult is not a JSON object"))?;
    last.insert("resultCode".to_string(), Value::from(result.result_code));
    last.insert(
        "extendedResultCode".to_string(),
        Value::from(result.extended_result_code),
    );
    Ok(value)
}
