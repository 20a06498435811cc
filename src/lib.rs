//! rabbitbus - RabbitMQ event bus adapter
//!
//! Publishes domain events to one queue per event type and dispatches
//! consumed messages to locally registered handlers.

pub mod bus;
pub mod config;
pub mod mediator;
pub mod message;
pub mod utils;

pub use bus::{BusError, EventBus, EventHandler, HandlerError, HandlerResult};
pub use message::{Command, Event, Message, MessageHeader};
