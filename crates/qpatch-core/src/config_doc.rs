//! The JSON config document carried inside the archive.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PatcherError;

/// Document injected when no override is configured.
pub const DEFAULT_CONFIG_DOCUMENT: &str = include_str!("../assets/config.json");

/// Field that receives the device serial by default.
pub const DEFAULT_HOST_FIELD: &str = "loginservice_host";

/// A flat JSON object. Field order is preserved across load and save.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    fields: Map<String, Value>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Result<Self, PatcherError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PatcherError::ConfigParseError(format!("invalid JSON: {e}")))?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(PatcherError::ConfigParseError(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PatcherError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Append `suffix` to the string field `field` and return the new value.
    pub fn append_to_field(&mut self, field: &str, suffix: &str) -> Result<String, PatcherError> {
        let value = self
            .fields
            .get_mut(field)
            .ok_or_else(|| PatcherError::ConfigParseError(format!("field {field:?} is missing")))?;
        let Value::String(current) = value else {
            return Err(PatcherError::ConfigParseError(format!(
                "field {field:?} is a {}, expected a string",
                json_kind(value)
            )));
        };
        current.push_str(suffix);
        Ok(current.clone())
    }

    /// Serialize with two-space indentation.
    pub fn to_pretty_string(&self) -> Result<String, PatcherError> {
        Ok(serde_json::to_string_pretty(&self.fields)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatcherError> {
        std::fs::write(path, self.to_pretty_string()?)?;
        Ok(())
    }
}

/// Rewrite the document at `path` so `field` ends with `serial`.
pub fn bind_to_device(path: &Path, field: &str, serial: &str) -> Result<String, PatcherError> {
    let mut document = ConfigDocument::load(path)?;
    let value = document.append_to_field(field, serial)?;
    document.save(path)?;
    debug!(path = %path.display(), field, value = %value, "Bound config document to device");
    Ok(value)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
