//! Mock broker implementation for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BusError, Delivery, DeliveryCallback, Result};

/// Mock broker for testing.
///
/// Records published messages and registered consumers instead of talking
/// to a server. `deliver` plays the broker's part by handing a message to
/// the consumer of its queue.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<Delivery>>,
    consumers: RwLock<HashMap<String, DeliveryCallback>>,
    fail_on_publish: RwLock<bool>,
    fail_on_consume: RwLock<bool>,
    calls: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_consume(&self, fail: bool) {
        *self.fail_on_consume.write().await = fail;
    }

    /// Number of `publish` and `consume` calls, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<Delivery> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Queues with a registered consumer, sorted.
    pub async fn consumed_queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self.consumers.read().await.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Hand `body` to the consumer of `queue`. Returns false if nobody consumes it.
    pub async fn deliver(&self, queue: &str, body: Vec<u8>) -> bool {
        let callback = self.consumers.read().await.get(queue).cloned();
        match callback {
            Some(callback) => {
                callback(Delivery {
                    routing_key: queue.to_string(),
                    body,
                })
                .await;
                true
            }
            None => false,
        }
    }

    /// Deliver everything published so far to the matching consumers.
    ///
    /// Returns how many messages found a consumer.
    pub async fn deliver_published(&self) -> usize {
        let mut delivered = 0;
        for message in self.take_published().await {
            if self.deliver(&message.routing_key, message.body).await {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push(Delivery {
            routing_key: queue.to_string(),
            body: payload.to_vec(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_consume.read().await {
            return Err(BusError::Connection("Mock consume failure".to_string()));
        }
        self.consumers
            .write()
            .await
            .insert(queue.to_string(), callback);
        Ok(())
    }
}
