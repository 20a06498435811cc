//! Event bus over a message broker.
//!
//! This module contains:
//! - `Broker` trait: per-queue publishing and consumer registration
//! - `EventHandler` trait: typed processing of one event kind
//! - `EventBus`: publish / subscribe / consume orchestration
//! - Broker implementations: AMQP (RabbitMQ), in-memory channel, mock

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};
use crate::message::Event;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod dispatch;
mod event_bus;
pub mod mock;
pub mod registry;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;
pub use dispatch::DispatchResult;
pub use event_bus::EventBus;
pub use mock::MockBroker;
pub use registry::HandlerRegistry;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler '{handler}' is already registered for '{event}'")]
    DuplicateRegistration { handler: String, event: String },

    #[error("Event '{event}' is already bound to type {existing}, cannot bind {attempted}")]
    DiscriminatorConflict {
        event: String,
        existing: String,
        attempted: String,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation '{operation}' is not supported (message type '{message_type}')")]
    Unsupported {
        operation: &'static str,
        message_type: String,
    },

    #[error("Handler '{handler}' failed on '{event}': {message}")]
    HandlerFailed {
        handler: String,
        event: String,
        message: String,
    },
}

impl BusError {
    /// True for the fixed result of operations this bus does not implement.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// True when the broker was unreachable or rejected the operation.
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Publish(_) | Self::Subscribe(_)
        )
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Error a handler reports back to dispatch.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Processes events of one type.
///
/// A fresh handler is built for every delivery, so handlers keep no state
/// between events unless their factory shares it.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E) -> HandlerResult;
}

/// A raw message as handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Routing key the message arrived with; the event discriminator.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
}

/// Callback a broker invokes once per delivered message.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport the bus publishes to and consumes from.
///
/// Every queue is named after an event discriminator and declared
/// non-durable, non-exclusive and not auto-deleted.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-process queues
/// - `MockBroker`: recording test double
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `queue` and publish `payload` to it through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Declare `queue` and start delivering its messages to `callback`.
    ///
    /// Messages are acknowledged on delivery, before the callback runs.
    /// Returns once the consumer is registered; delivery continues in the
    /// background.
    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// AMQP requires the `amqp` feature (included in default).
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(config.rabbitmq.clone()).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
    }
}

/// Initialize an event bus on top of the configured broker.
pub async fn init_event_bus(config: &MessagingConfig) -> Result<EventBus> {
    let broker = init_broker(config).await?;
    Ok(EventBus::new(broker))
}
