//! Cloud property bridge: routes property-changed notifications to the orchestrator
//! and acknowledges them.

use serde_json::Value;
use tracing::{debug, warn};

use crate::io::transport::ACK_STATUS_OK;
use crate::workflow::WorkflowContext;

/// Fields that must never be echoed back in an acknowledgement.
const ACK_REDACTED_FIELDS: [&str; 2] = ["updateManifestSignature", "fileUrls"];

/// Handle a change of `property` carrying `payload` at `version`.
///
/// The orchestrator receives the original payload; the acknowledgement echoes a
/// reduced copy with a fixed success status, whatever the orchestration outcome.
/// Returns whether the acknowledgement was sent; other properties return `false`.
pub fn on_property_changed(
    context: &mut WorkflowContext,
    property: &str,
    payload: &Value,
    version: i64,
) -> bool {
    let names = context.options().names.clone();
    if property != names.service {
        debug!(property = %property, "ignoring property change");
        return false;
    }

    let reduced = reduce_for_ack(payload);
    context.handle_action(payload);

    let ack = names.service_ack(reduced, ACK_STATUS_OK, version);
    let sent = context.send_patch(&ack);
    if !sent {
        warn!(version, "acknowledgement not sent");
    }
    sent
}

/// Copy of `payload` with large or sensitive fields set to `null`.
pub fn reduce_for_ack(payload: &Value) -> Value {
    let mut reduced = payload.clone();
    if let Some(object) = reduced.as_object_mut() {
        for field in ACK_REDACTED_FIELDS {
            object.insert(field.to_string(), Value::Null);
        }
    }
    reduced
}
