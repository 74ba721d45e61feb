//! Parsing of the cloud-to-device update action and its manifest.
//!
//! Two levels of failure are kept apart: a payload that is not an update action
//! at all (schema violation, unknown action) is rejected by [`parse_action`],
//! while a well-formed action whose manifest is unusable is rejected later by
//! [`UpdateManifest::parse`] so the workflow can still be reported as failed.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Validator, validator_for};
use serde::Deserialize;
use serde_json::Value;

use crate::core::action::UpdateAction;

const UPDATE_ACTION_SCHEMA: &str = include_str!("../../schemas/update_action.schema.json");

/// Compiled once; a broken embedded schema surfaces as an error on every parse.
static UPDATE_ACTION_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(UPDATE_ACTION_SCHEMA)
        .map_err(|err| format!("parse update action schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid update action schema: {err}"))
});

/// A validated update action, manifest still raw.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action: UpdateAction,
    pub workflow_id: String,
    pub retry_timestamp: Option<String>,
    pub manifest: Option<Value>,
    pub file_urls: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    workflow: Option<RawWorkflow>,
    action: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
    id: Option<String>,
    retry_timestamp: Option<String>,
    update_manifest: Option<Value>,
    file_urls: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkflow {
    action: Value,
    id: String,
    retry_timestamp: Option<String>,
}

/// Validate `payload` against the update action schema and extract the action.
pub fn parse_action(payload: &Value) -> Result<ActionRequest> {
    validate_schema(payload)?;
    let raw: RawAction =
        serde_json::from_value(payload.clone()).context("deserialize update action")?;

    let (action_value, workflow_id, retry_timestamp) = match raw.workflow {
        Some(workflow) => (workflow.action, workflow.id, workflow.retry_timestamp),
        None => {
            let action = raw
                .action
                .or(raw.kind)
                .ok_or_else(|| anyhow!("update action missing action"))?;
            let id = raw.id.ok_or_else(|| anyhow!("update action missing id"))?;
            (action, id, raw.retry_timestamp)
        }
    };

    let action = UpdateAction::from_value(&action_value)
        .ok_or_else(|| anyhow!("unknown update action {action_value}"))?;
    if workflow_id.trim().is_empty() {
        bail!("update action has an empty workflow id");
    }

    let manifest = match raw.update_manifest {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    };

    Ok(ActionRequest {
        action,
        workflow_id,
        retry_timestamp: retry_timestamp.filter(|ts| !ts.is_empty()),
        manifest,
        file_urls: raw.file_urls.unwrap_or_default(),
    })
}

fn validate_schema(payload: &Value) -> Result<()> {
    let compiled = UPDATE_ACTION_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("{err}"))?;
    if !compiled.is_valid(payload) {
        let messages = compiled
            .iter_errors(payload)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!(
            "update action schema validation failed: {}",
            messages.join("; ")
        );
    }
    Ok(())
}

/// A content file referenced by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFile {
    pub file_id: String,
    pub file_name: String,
    pub url: Option<String>,
    pub size_in_bytes: Option<u64>,
    pub hashes: BTreeMap<String, String>,
}

/// One entry of `instructions.steps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStep {
    pub update_type: String,
    pub installed_criteria: Option<String>,
    pub files: Vec<UpdateFile>,
}

/// The parts of the update manifest the orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    /// Installed update id reported on success (compact JSON of `updateId`).
    pub update_id: Option<String>,
    pub update_type: String,
    pub installed_criteria: Option<String>,
    pub steps: Vec<ManifestStep>,
    pub files: Vec<UpdateFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    update_id: Option<Value>,
    update_type: Option<String>,
    installed_criteria: Option<String>,
    instructions: Option<RawInstructions>,
    #[serde(default)]
    files: BTreeMap<String, RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawInstructions {
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    handler: Option<String>,
    handler_properties: Option<RawHandlerProperties>,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHandlerProperties {
    installed_criteria: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFile {
    file_name: String,
    size_in_bytes: Option<u64>,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

impl UpdateManifest {
    /// Parse `updateManifest`, which arrives either as an object or as a JSON string.
    pub fn parse(manifest: &Value, file_urls: &BTreeMap<String, String>) -> Result<Self> {
        let raw: RawManifest = match manifest {
            Value::String(text) => {
                serde_json::from_str(text).context("parse updateManifest string")?
            }
            other => serde_json::from_value(other.clone()).context("parse updateManifest")?,
        };

        let files: BTreeMap<String, UpdateFile> = raw
            .files
            .into_iter()
            .map(|(file_id, file)| {
                let entry = UpdateFile {
                    url: file_urls.get(&file_id).cloned(),
                    file_id: file_id.clone(),
                    file_name: file.file_name,
                    size_in_bytes: file.size_in_bytes,
                    hashes: file.hashes,
                };
                (file_id, entry)
            })
            .collect();

        let mut steps = Vec::new();
        let raw_steps = raw.instructions.map(|i| i.steps).unwrap_or_default();
        for (index, step) in raw_steps.into_iter().enumerate() {
            let update_type = step
                .handler
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| anyhow!("step {index} has no handler"))?;
            let step_files = step
                .files
                .iter()
                .map(|id| {
                    files
                        .get(id)
                        .cloned()
                        .ok_or_else(|| anyhow!("step {index} references unknown file '{id}'"))
                })
                .collect::<Result<Vec<_>>>()?;
            steps.push(ManifestStep {
                update_type,
                installed_criteria: step.handler_properties.and_then(|p| p.installed_criteria),
                files: step_files,
            });
        }

        let update_type = raw
            .update_type
            .filter(|t| !t.trim().is_empty())
            .or_else(|| steps.first().map(|s| s.update_type.clone()))
            .ok_or_else(|| anyhow!("manifest has no updateType and no steps"))?;

        let update_id = match raw.update_id {
            Some(Value::String(id)) => Some(id),
            Some(value @ Value::Object(_)) => {
                Some(serde_json::to_string(&value).context("serialize updateId")?)
            }
            _ => None,
        };

        Ok(Self {
            update_id,
            update_type,
            installed_criteria: raw.installed_criteria,
            steps,
            files: files.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_workflow_form() {
        let payload = json!({
            "workflow": { "action": 3, "id": "wf-1", "retryTimestamp": "2024-01-01T00:00:00Z" },
            "updateManifest": "{\"updateType\":\"contoso/fw:1\"}",
            "updateManifestSignature": "sig",
            "fileUrls": { "f1": "http://example.invalid/f1" }
        });

        let request = parse_action(&payload).expect("parse");
        assert_eq!(request.action, UpdateAction::ProcessDeployment);
        assert_eq!(request.workflow_id, "wf-1");
        assert_eq!(
            request.retry_timestamp.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(request.manifest.is_some());
        assert_eq!(request.file_urls.len(), 1);
    }

    #[test]
    fn embedded_schema_compiles() {
        assert!(UPDATE_ACTION_VALIDATOR.as_ref().is_ok());
    }

    #[test]
    fn parses_flat_form_with_type_alias() {
        let request = parse_action(&json!({ "type": "install", "id": "wf-1" })).expect("parse");
        assert_eq!(request.action, UpdateAction::Install);
        assert_eq!(request.workflow_id, "wf-1");
        assert_eq!(request.manifest, None);
    }

    #[test]
    fn rejects_payload_without_workflow_id() {
        let err = parse_action(&json!({ "workflow": { "action": 3 } })).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn rejects_unknown_action() {
        let err = parse_action(&json!({ "action": 17, "id": "wf-1" })).unwrap_err();
        assert!(err.to_string().contains("unknown update action"));
    }

    #[test]
    fn manifest_resolves_step_files_and_urls() {
        let manifest = json!({
            "updateId": { "provider": "contoso", "name": "toaster", "version": "1.0" },
            "instructions": {
                "steps": [
                    { "handler": "contoso/script:1", "files": ["f1"],
                      "handlerProperties": { "installedCriteria": "1.0" } },
                    { "handler": "contoso/fw:1" }
                ]
            },
            "files": { "f1": { "fileName": "install.sh", "sizeInBytes": 12 } }
        });
        let urls = BTreeMap::from([("f1".to_string(), "http://example.invalid/f1".to_string())]);

        let parsed = UpdateManifest::parse(&manifest, &urls).expect("manifest");
        assert_eq!(parsed.update_type, "contoso/script:1");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[0].installed_criteria.as_deref(), Some("1.0"));
        assert_eq!(
            parsed.steps[0].files[0].url.as_deref(),
            Some("http://example.invalid/f1")
        );
        assert!(parsed.steps[1].files.is_empty());
        let update_id: Value =
            serde_json::from_str(parsed.update_id.as_deref().expect("update id")).expect("json");
        assert_eq!(update_id["name"], "toaster");
    }

    #[test]
    fn manifest_rejects_unknown_file_reference() {
        let manifest = json!({
            "updateType": "contoso/fw:1",
            "instructions": { "steps": [ { "handler": "contoso/fw:1", "files": ["nope"] } ] }
        });
        let err = UpdateManifest::parse(&manifest, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown file"));
    }

    #[test]
    fn manifest_requires_some_update_type() {
        let err = UpdateManifest::parse(&json!({}), &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("no updateType"));
    }
}
