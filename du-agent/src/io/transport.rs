//! Seam to the cloud transport and the reported-property envelopes it carries.

use anyhow::Result;
use serde_json::{Map, Value, json};

/// Publishes a serialized reported-property patch.
///
/// Connection handling is owned by the implementor; an `Err` means the patch was
/// not accepted and is not retried here.
pub trait ReportSender {
    fn send(&self, payload: &str) -> Result<()>;
}

/// Success status echoed in acknowledgements.
pub const ACK_STATUS_OK: u16 = 200;

/// Names of the component and properties used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNames {
    pub component: String,
    pub agent: String,
    pub service: String,
}

impl Default for PropertyNames {
    fn default() -> Self {
        Self {
            component: "deviceUpdate".to_string(),
            agent: "agent".to_string(),
            service: "service".to_string(),
        }
    }
}

impl PropertyNames {
    /// `{"<component>": {"__t": "c", "<agent>": value}}`
    pub fn agent_patch(&self, value: Value) -> Value {
        component_patch(&self.component, &self.agent, value)
    }

    /// `{"<component>": {"__t": "c", "<service>": {"value", "ac", "ad", "av"}}}`
    pub fn service_ack(&self, value: Value, status: u16, version: i64) -> Value {
        component_patch(
            &self.component,
            &self.service,
            json!({
                "value": value,
                "ac": status,
                "ad": "",
                "av": version,
            }),
        )
    }
}

fn component_patch(component: &str, property: &str, value: Value) -> Value {
    let mut inner = Map::new();
    inner.insert("__t".to_string(), Value::from("c"));
    inner.insert(property.to_string(), value);
    let mut outer = Map::new();
    outer.insert(component.to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Content of the agent property sent once per connection.
pub fn startup_message(device_properties: &Map<String, Value>, compat_property_names: &str) -> Value {
    json!({
        "deviceProperties": device_properties,
        "compatPropertyNames": compat_property_names,
    })
}
