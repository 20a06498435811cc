//! In-memory channel-based broker for standalone mode.
//!
//! Each queue is an unbounded tokio mpsc channel. Messages published before
//! anyone consumes a queue wait in the channel, as they would in a broker
//! queue. Ideal for local development and testing without RabbitMQ.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{Broker, BusError, Delivery, DeliveryCallback, Result};

struct Queue {
    sender: mpsc::UnboundedSender<Delivery>,
    /// Taken by the first consumer.
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-memory broker with one single-consumer queue per event type.
#[derive(Default)]
pub struct ChannelBroker {
    queues: Mutex<HashMap<String, Queue>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of declared queues, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_string()).or_insert_with(Queue::new);

        entry
            .sender
            .send(Delivery {
                routing_key: queue.to_string(),
                body: payload.to_vec(),
            })
            .map_err(|e| BusError::Publish(format!("Queue '{}' is closed: {}", queue, e)))?;

        debug!(queue = %queue, "Published via channel");
        Ok(())
    }

    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<()> {
        let mut receiver = {
            let mut queues = self.queues.lock().await;
            let entry = queues.entry(queue.to_string()).or_insert_with(Queue::new);
            entry.receiver.take().ok_or_else(|| {
                BusError::Subscribe(format!("Queue '{}' already has a consumer", queue))
            })?
        };

        let name = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                callback(delivery).await;
            }
            info!(queue = %name, "Channel closed, stopping consumer");
        });

        info!(queue = %queue, "Channel consumer started");
        Ok(())
    }
}
