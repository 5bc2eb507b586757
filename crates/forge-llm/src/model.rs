//! The [`LanguageModel`] trait and request types.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use forge_core::error::AgentError;
use forge_core::events::StreamEvent;
use forge_core::tool::ToolDefinition;

use crate::format::ProviderMessage;

/// A boxed stream of typed chunk events.
///
/// `Err` items carry stream-level failures (connection drop, provider error
/// frame); the consumer classifies them into the error taxonomy.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AgentError>> + Send>>;

/// One model-ready request.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    /// Provider-formatted messages, oldest first.
    pub messages: Vec<ProviderMessage>,
    /// Active tool set presented to the model.
    pub tools: Vec<ToolDefinition>,
}

/// An opaque streaming language model, resolved externally by provider and
/// model id.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// The model id recorded on assistant messages.
    fn id(&self) -> &str;

    /// Execute one streaming call.
    ///
    /// Implementations must honor `cancel` at every await point. A returned
    /// error means the request never started streaming (e.g. credential
    /// resolution or connection setup failed).
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelStream, AgentError>;
}
