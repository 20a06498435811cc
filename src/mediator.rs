//! Mediator seam handlers use to route work onwards.
//!
//! The bus never calls the mediator itself; it only carries one so handler
//! factories can hand it to the handlers they build.

use async_trait::async_trait;

use crate::bus::HandlerError;
use crate::message::Message;

/// Black-box request dispatcher.
#[async_trait]
pub trait Mediator: Send + Sync {
    /// Route a serialized message. Returns whether it was handled.
    async fn send(
        &self,
        message_type: &str,
        payload: serde_json::Value,
    ) -> Result<bool, HandlerError>;
}

/// Serialize `message` and route it through `mediator`.
pub async fn send_message<M: Message>(
    mediator: &dyn Mediator,
    message: &M,
) -> Result<bool, HandlerError> {
    let payload = serde_json::to_value(message)?;
    mediator.send(M::message_type(), payload).await
}
