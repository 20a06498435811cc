//! Message base types shared by events and commands.
//!
//! Concrete messages are plain serde structs that embed a [`MessageHeader`]
//! with `#[serde(flatten)]` and implement [`Event`] or [`Command`]:
//!
//! ```ignore
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! #[serde(rename_all = "PascalCase")]
//! struct OrderCreated {
//!     #[serde(flatten)]
//!     header: MessageHeader,
//!     order_id: String,
//!     amount: f64,
//! }
//!
//! impl Message for OrderCreated {}
//! impl Event for OrderCreated {
//!     fn header(&self) -> &MessageHeader {
//!         &self.header
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Anything that travels over the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator used as queue name and registry key.
    ///
    /// Defaults to the short type name, so `orders::OrderCreated` becomes
    /// `OrderCreated`. Override when two services name the type differently.
    fn message_type() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A fact that already happened.
pub trait Event: Message {
    fn header(&self) -> &MessageHeader;

    /// When the event was raised.
    fn timestamp(&self) -> DateTime<Utc> {
        self.header().timestamp
    }
}

/// A request for an action. Sending commands is not supported yet.
pub trait Command: Message {
    fn header(&self) -> &MessageHeader;

    fn timestamp(&self) -> DateTime<Utc> {
        self.header().timestamp
    }
}

/// Discriminator and creation time carried by every message body.
///
/// Serialized with PascalCase keys (`MessageType`, `Timestamp`) so bodies
/// stay readable by non-Rust services sharing the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageHeader {
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    /// Header for a message of type `M`, stamped now.
    pub fn new<M: Message>() -> Self {
        Self::at::<M>(Utc::now())
    }

    /// Header for a message of type `M` with an explicit timestamp.
    pub fn at<M: Message>(timestamp: DateTime<Utc>) -> Self {
        Self {
            message_type: M::message_type().to_string(),
            timestamp,
        }
    }
}

/// Serialize a message to its JSON wire form.
pub fn encode<M: Message>(message: &M) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

/// Deserialize a message from its JSON wire form.
pub fn decode<M: Message>(payload: &[u8]) -> serde_json::Result<M> {
    serde_json::from_slice(payload)
}

/// Last path segment of a type name, without generic parameters.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
