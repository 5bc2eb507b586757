//! Tool execution errors.

/// Why a tool invocation failed.
///
/// The executor turns every variant into a terminal `output-error` part;
/// only `InvalidInput` additionally feeds the request-level error taxonomy
/// (as `invalid-tool-input`).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// The input failed the tool's declared schema.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Validation failure description.
        message: String,
    },

    /// The tool itself failed.
    #[error("{message}")]
    Execution {
        /// Failure description, surfaced to the model as the tool result.
        message: String,
    },

    /// The invocation was cancelled before completion.
    #[error("tool cancelled")]
    Cancelled,
}

impl ToolError {
    /// Wrap an arbitrary failure as an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}
