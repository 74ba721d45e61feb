//! End-to-end workflow scenarios driven through the property bridge.
//!
//! Each test wires a `WorkflowContext` to scripted doubles, feeds it cloud
//! property changes, and inspects the reported documents and handler calls.

use serde_json::{Map, Value, json};

use du_agent::bridge::on_property_changed;
use du_agent::core::result::{InstalledState, UpdateResult, codes, erc};
use du_agent::io::persistence::SnapshotStore;
use du_agent::test_support::{
    Harness, ScriptedHandler, UPDATE_TYPE, cancel_payload, deployment_payload, expected_update_id,
    manifest,
};

fn device_properties() -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("manufacturer".to_string(), json!("contoso"));
    props.insert("model".to_string(), json!("toaster"));
    props
}

/// Two-step install through the bridge.
///
/// Handler sequence: download, install(step 0), install(step 1), apply.
/// Final report: `Idle`, installed update id, both step results successful.
#[test]
fn two_step_install_reports_idle_with_installed_update_id() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    let payload = json!({
        "type": "install",
        "id": "wf-1",
        "updateManifest": manifest(2),
        "updateManifestSignature": "sig",
        "fileUrls": {}
    });

    assert!(on_property_changed(&mut h.context, "service", &payload, 4));
    h.context.run_until_idle();

    assert_eq!(
        h.log.calls(),
        vec!["download root", "install step_0", "install step_1", "apply root"]
    );
    let last = h.sender.last_state_report().expect("terminal report");
    assert_eq!(last["state"], 0);
    assert_eq!(last["workflow"]["id"], "wf-1");
    assert_eq!(last["workflow"]["action"], 1);
    assert_eq!(last["installedUpdateId"], expected_update_id());
    assert_eq!(last["lastInstallResult"]["resultCode"], codes::APPLY_SUCCESS);
    let steps = last["lastInstallResult"]["stepResults"]
        .as_object()
        .expect("step results");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps["step_0"]["resultCode"], codes::INSTALL_SUCCESS);
    assert_eq!(steps["step_1"]["resultCode"], codes::INSTALL_SUCCESS);
}

/// Exactly one terminal report per new workflow id, carrying that id.
#[test]
fn each_new_workflow_gets_one_terminal_report() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    for id in ["wf-1", "wf-2", "wf-3"] {
        on_property_changed(&mut h.context, "service", &deployment_payload(id, 1), 1);
        h.context.run_until_idle();
    }

    let terminal: Vec<String> = h
        .sender
        .state_reports()
        .into_iter()
        .filter(|report| report["state"] == 0 || report["state"] == 255)
        .filter_map(|report| report["workflow"]["id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(terminal, vec!["wf-1", "wf-2", "wf-3"]);
}

#[test]
fn step_keys_are_dense_and_absent_while_download_starts() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    on_property_changed(&mut h.context, "service", &deployment_payload("wf-1", 4), 1);
    h.context.run_until_idle();

    for report in h.sender.state_reports() {
        let last = &report["lastInstallResult"];
        match report["state"].as_i64() {
            Some(1) | Some(6) => assert_eq!(last["stepResults"], Value::Null),
            _ => {
                let keys: Vec<String> = last["stepResults"]
                    .as_object()
                    .expect("step results")
                    .keys()
                    .cloned()
                    .collect();
                assert_eq!(keys, vec!["step_0", "step_1", "step_2", "step_3"]);
            }
        }
    }
}

/// The acknowledgement echoes the payload without signature or file URLs.
#[test]
fn acknowledgement_never_contains_sensitive_fields() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    let mut payload = deployment_payload("wf-1", 1);
    payload["fileUrls"] = json!({ "f1": "https://blob.example.invalid/f1?sig=secret" });
    payload["updateManifestSignature"] = json!("very-secret-signature");

    assert!(on_property_changed(&mut h.context, "service", &payload, 17));

    let acks = h.sender.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["ac"], 200);
    assert_eq!(acks[0]["ad"], "");
    assert_eq!(acks[0]["av"], 17);
    assert_eq!(acks[0]["value"]["updateManifestSignature"], Value::Null);
    assert_eq!(acks[0]["value"]["fileUrls"], Value::Null);
    assert_eq!(acks[0]["value"]["workflow"]["id"], "wf-1");
    let raw = serde_json::to_string(&h.sender.payloads()).expect("json");
    assert!(!raw.contains("very-secret-signature"));
    assert!(!raw.contains("sig=secret"));
}

#[test]
fn malformed_action_is_still_acknowledged() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    assert!(on_property_changed(
        &mut h.context,
        "service",
        &json!({ "workflow": 12 }),
        2
    ));
    assert_eq!(h.sender.acks().len(), 1);
    assert!(h.sender.state_reports().is_empty());
    assert!(h.log.calls().is_empty());
}

#[test]
fn other_properties_are_ignored() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    assert!(!on_property_changed(
        &mut h.context,
        "agent",
        &deployment_payload("wf-1", 1),
        3
    ));
    assert!(h.sender.payloads().is_empty());
    assert!(h.context.tree().is_none());
}

#[test]
fn cancel_before_apply_never_applies() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    on_property_changed(&mut h.context, "service", &deployment_payload("wf-1", 2), 1);
    h.context.do_work();
    on_property_changed(&mut h.context, "service", &cancel_payload("wf-1"), 2);
    h.context.run_until_idle();

    assert_eq!(h.log.count("apply"), 0);
    assert_eq!(h.log.count("cancel"), 1);
    let last = h.sender.last_state_report().expect("report");
    assert_eq!(last["state"], 0);
    assert_eq!(last["workflow"]["id"], "wf-1");
    assert_eq!(
        last["lastInstallResult"]["resultCode"],
        codes::FAILURE_CANCELLED
    );
    assert_eq!(
        last["lastInstallResult"]["extendedResultCode"],
        erc::CANCELLED
    );
}

/// Reboot-required apply, then a fresh process resumes from the snapshot.
///
/// The first process persists before apply and reboots exactly once. The second
/// reports the persisted document patched with the real outcome, without running
/// any phase handler again.
#[test]
fn reboot_then_resume_reports_success_with_same_workflow() {
    let handler =
        ScriptedHandler::new().with_apply(UpdateResult::new(codes::APPLY_REQUIRED_REBOOT, 0));
    let mut before = Harness::new(handler).expect("harness");
    on_property_changed(&mut before.context, "service", &deployment_payload("wf-1", 1), 1);
    before.context.run_until_idle();

    assert_eq!(before.rebooter.count(), 1);
    assert!(before.rebooter.saw_watched_file());
    let snapshot = before.store().load().expect("load").expect("snapshot");
    assert_eq!(snapshot.workflow_id, "wf-1");
    assert_eq!(snapshot.update_type, UPDATE_TYPE);
    let persisted: Value = serde_json::from_str(&snapshot.reporting_json).expect("json");
    assert_eq!(
        persisted["lastInstallResult"]["resultCode"],
        codes::APPLY_IN_PROGRESS
    );
    assert!(persisted.get("installedUpdateId").is_none());

    let mut after =
        Harness::new(ScriptedHandler::new().with_installed(InstalledState::Installed))
            .expect("harness");
    after.store().save(&snapshot).expect("restore snapshot");

    assert!(after.context.on_connected(&device_properties()));

    assert_eq!(after.log.calls(), vec!["is_installed root"]);
    let reports = after.sender.state_reports();
    assert_eq!(reports.len(), 1);
    let mut expected = persisted.clone();
    expected["lastInstallResult"]["resultCode"] = json!(codes::APPLY_SUCCESS);
    expected["installedUpdateId"] = json!(expected_update_id());
    assert_eq!(reports[0], expected);
    assert_eq!(reports[0]["workflow"]["id"], "wf-1");
    assert!(after.store().load().expect("load").is_none());

    let agent = after.sender.agent_reports();
    let startup = agent.last().expect("startup message");
    assert_eq!(startup["compatPropertyNames"], "manufacturer,model");
    assert_eq!(startup["deviceProperties"]["model"], "toaster");
}

/// Immediate reboot requested by the first of two steps.
///
/// After the restart the progress report is replayed without an installed check,
/// and the redelivered action runs only the second step and apply.
#[test]
fn install_time_reboot_resumes_with_remaining_steps() {
    let handler = ScriptedHandler::new().with_step_install(
        0,
        UpdateResult::new(codes::INSTALL_REQUIRED_IMMEDIATE_REBOOT, 0),
    );
    let mut before = Harness::new(handler).expect("harness");
    on_property_changed(&mut before.context, "service", &deployment_payload("wf-1", 2), 1);
    before.context.run_until_idle();
    assert_eq!(
        before.log.calls(),
        vec!["download root", "install step_0", "reboot"]
    );
    let snapshot = before.store().load().expect("load").expect("snapshot");
    let persisted: Value = serde_json::from_str(&snapshot.reporting_json).expect("json");

    let mut after = Harness::new(ScriptedHandler::new()).expect("harness");
    after.store().save(&snapshot).expect("restore snapshot");
    after.context.on_connected(&device_properties());

    assert!(after.log.calls().is_empty());
    let reports = after.sender.state_reports();
    assert_eq!(reports, vec![persisted]);
    assert_eq!(reports[0]["state"], 3);
    assert!(reports[0].get("installedUpdateId").is_none());
    assert!(after.store().load().expect("load").is_none());

    on_property_changed(&mut after.context, "service", &deployment_payload("wf-1", 2), 2);
    after.context.run_until_idle();

    assert_eq!(after.log.calls(), vec!["install step_1", "apply root"]);
    let last = after.sender.last_state_report().expect("terminal report");
    assert_eq!(last["state"], 0);
    assert_eq!(last["lastInstallResult"]["resultCode"], codes::APPLY_SUCCESS);
    assert_eq!(last["installedUpdateId"], expected_update_id());
    let steps = &last["lastInstallResult"]["stepResults"];
    assert_eq!(
        steps["step_0"]["resultCode"],
        codes::INSTALL_REQUIRED_IMMEDIATE_REBOOT
    );
    assert_eq!(steps["step_1"]["resultCode"], codes::INSTALL_SUCCESS);
}

/// A redelivery of the resumed workflow's action does not restart it.
#[test]
fn resumed_workflow_is_not_rerun_on_redelivery() {
    let handler =
        ScriptedHandler::new().with_apply(UpdateResult::new(codes::APPLY_REQUIRED_REBOOT, 0));
    let mut before = Harness::new(handler).expect("harness");
    on_property_changed(&mut before.context, "service", &deployment_payload("wf-1", 1), 1);
    before.context.run_until_idle();
    let snapshot = before.store().load().expect("load").expect("snapshot");

    let mut after = Harness::new(ScriptedHandler::new()).expect("harness");
    after.store().save(&snapshot).expect("restore snapshot");
    after.context.on_connected(&device_properties());
    on_property_changed(&mut after.context, "service", &deployment_payload("wf-1", 1), 1);
    after.context.run_until_idle();

    assert_eq!(after.log.calls(), vec!["is_installed root"]);
}

#[test]
fn cold_start_reports_idle_then_startup_message() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    assert!(h.context.on_connected(&device_properties()));

    let agent = h.sender.agent_reports();
    assert_eq!(agent.len(), 2);
    assert_eq!(agent[0]["state"], 0);
    assert!(agent[0].get("workflow").is_none());
    assert_eq!(
        agent[0]["lastInstallResult"]["resultCode"],
        codes::NOT_STARTED
    );
    assert_eq!(agent[1]["compatPropertyNames"], "manufacturer,model");

    // Reconnection only repeats the startup message.
    h.context.on_connected(&device_properties());
    assert_eq!(h.sender.state_reports().len(), 1);
    assert_eq!(h.sender.agent_reports().len(), 3);
}

#[test]
fn corrupt_snapshot_starts_cold() {
    let mut h = Harness::new(ScriptedHandler::new()).expect("harness");
    let path = h.snapshot_path();
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, "{ truncated").expect("write");

    h.context.on_connected(&device_properties());

    assert!(h.log.calls().is_empty());
    let reports = h.sender.state_reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].get("workflow").is_none());
}

#[test]
fn failed_resume_send_keeps_snapshot() {
    let handler =
        ScriptedHandler::new().with_apply(UpdateResult::new(codes::APPLY_REQUIRED_REBOOT, 0));
    let mut before = Harness::new(handler).expect("harness");
    on_property_changed(&mut before.context, "service", &deployment_payload("wf-1", 0), 1);
    before.context.run_until_idle();
    let snapshot = before.store().load().expect("load").expect("snapshot");

    let mut after = Harness::new(ScriptedHandler::new()).expect("harness");
    after.store().save(&snapshot).expect("restore snapshot");
    after.sender.set_failing(true);

    assert!(after.context.resume_from_snapshot());
    assert_eq!(after.store().load().expect("load"), Some(snapshot));
}

#[test]
fn resume_without_handler_reports_failure() {
    let handler =
        ScriptedHandler::new().with_apply(UpdateResult::new(codes::APPLY_REQUIRED_REBOOT, 0));
    let mut before = Harness::new(handler).expect("harness");
    on_property_changed(&mut before.context, "service", &deployment_payload("wf-1", 0), 1);
    before.context.run_until_idle();
    let mut snapshot = before.store().load().expect("load").expect("snapshot");
    snapshot.update_type = "fabrikam/unknown:1".to_string();

    let mut after = Harness::new(ScriptedHandler::new()).expect("harness");
    after.store().save(&snapshot).expect("restore snapshot");
    after.context.on_connected(&device_properties());

    let report = after.sender.state_reports().remove(0);
    assert_eq!(report["lastInstallResult"]["resultCode"], codes::FAILURE);
    assert_eq!(
        report["lastInstallResult"]["extendedResultCode"],
        erc::HANDLER_NOT_FOUND
    );
}
