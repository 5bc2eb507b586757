//! Wire-level tool description shared between the tool registry and the
//! model request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool definition as presented to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Tool name (must be unique within the active tool set).
    pub name: String,
    /// Human/model-readable description.
    pub description: String,
    /// JSON schema for the tool input.
    pub input_schema: Value,
    /// JSON schema for the tool output, when declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolDefinition {
    /// Input property names the schema declares as required.
    #[must_use]
    pub fn required_inputs(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}
