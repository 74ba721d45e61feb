//! Update actions requested by the cloud.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;

/// Action carried in the `workflow.action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateAction {
    /// Stage the update content only.
    Download,
    /// Install the update: download (if needed), install every step, apply.
    Install,
    /// Apply an update whose install already succeeded.
    Apply,
    /// Same pipeline as `Install`; name used by newer services.
    ProcessDeployment,
    Cancel,
}

impl UpdateAction {
    pub fn code(self) -> i32 {
        match self {
            UpdateAction::Download => 0,
            UpdateAction::Install => 1,
            UpdateAction::Apply => 2,
            UpdateAction::ProcessDeployment => 3,
            UpdateAction::Cancel => 255,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let action = match code {
            0 => UpdateAction::Download,
            1 => UpdateAction::Install,
            2 => UpdateAction::Apply,
            3 => UpdateAction::ProcessDeployment,
            255 => UpdateAction::Cancel,
            _ => return None,
        };
        Some(action)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let action = match name.to_ascii_lowercase().as_str() {
            "download" => UpdateAction::Download,
            "install" => UpdateAction::Install,
            "apply" => UpdateAction::Apply,
            "processdeployment" => UpdateAction::ProcessDeployment,
            "cancel" => UpdateAction::Cancel,
            _ => return None,
        };
        Some(action)
    }

    /// Parse either wire form: an integer code or a case-insensitive name.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().and_then(Self::from_code),
            Value::String(s) => Self::from_name(s),
            _ => None,
        }
    }

    /// Actions that run the full download/install/apply pipeline.
    pub fn is_deployment(self) -> bool {
        matches!(self, UpdateAction::Install | UpdateAction::ProcessDeployment)
    }
}

impl Serialize for UpdateAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for UpdateAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        UpdateAction::from_value(&value)
            .ok_or_else(|| de::Error::custom(format!("unknown update action {value}")))
    }
}
