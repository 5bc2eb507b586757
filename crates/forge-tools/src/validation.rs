//! Input validation against the declared schema.
//!
//! Shallow validation only: the input must be a JSON object and every
//! `required` property must be present and non-null. Deep type checking is
//! left to the tool itself, which produces friendlier per-parameter
//! messages.

use serde_json::Value;

use forge_core::tool::ToolDefinition;

use crate::errors::ToolError;

/// Validate a finalized tool input against the tool's definition.
pub fn validate_input(definition: &ToolDefinition, input: &Value) -> Result<(), ToolError> {
    let Some(object) = input.as_object() else {
        return Err(ToolError::InvalidInput {
            message: format!("expected an object, got {}", type_name(input)),
        });
    };

    let missing: Vec<&str> = definition
        .required_inputs()
        .into_iter()
        .filter(|name| matches!(object.get(*name), None | Some(Value::Null)))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidInput {
            message: format!("missing required parameter(s): {}", missing.join(", ")),
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
