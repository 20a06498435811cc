//! AMQP (RabbitMQ) broker implementation.
//!
//! One queue per event type, reached through the default exchange with the
//! queue name as routing key. Connections come from a pool owned by the
//! broker; each publish opens and closes its own channel.

use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel,
};
use tracing::{debug, error, info, warn};

use super::{Broker, BusError, Delivery, DeliveryCallback, Result};
use crate::config::RabbitMqSettings;
use crate::utils::retry::consumer_backoff;

/// Maximum pooled connections per broker.
const POOL_SIZE: usize = 4;

/// Publishing goes through the nameless default exchange.
const DEFAULT_EXCHANGE: &str = "";

/// Queue attributes shared by publishers and consumers: not durable, not
/// exclusive, not auto-deleted.
fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        exclusive: false,
        auto_delete: false,
        ..Default::default()
    }
}

/// Consumers acknowledge on delivery.
fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: true,
        ..Default::default()
    }
}

/// RabbitMQ broker.
pub struct AmqpBroker {
    pool: Pool,
    settings: RabbitMqSettings,
}

impl AmqpBroker {
    /// Create the connection pool and verify the broker is reachable.
    pub async fn connect(settings: RabbitMqSettings) -> Result<Self> {
        let manager = Manager::new(settings.amqp_url(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(
            hostname = %settings.hostname(),
            username = %settings.username(),
            "Connected to RabbitMQ"
        );

        Ok(Self { pool, settings })
    }

    pub fn settings(&self) -> &RabbitMqSettings {
        &self.settings
    }

    /// Get a channel on a pooled connection.
    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
        channel
            .queue_declare(queue, queue_options(), FieldTable::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare queue: {}", e)))?;
        Ok(())
    }

    /// Set up consumer channel and queue.
    async fn setup_consumer(pool: &Pool, queue: &str) -> Result<lapin::Consumer> {
        let channel = Self::get_channel(pool).await?;
        Self::declare_queue(&channel, queue).await?;

        let consumer_tag = format!("rabbitbus-{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(queue, &consumer_tag, consume_options(), FieldTable::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");
        Ok(consumer)
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    ///
    /// Starts from an already registered consumer; later consumers are set
    /// up whenever the delivery stream ends or fails.
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        consumer: lapin::Consumer,
        callback: DeliveryCallback,
    ) {
        let backoff_builder = consumer_backoff();
        let mut backoff_iter = backoff_builder.build();
        let mut next = Some(consumer);

        loop {
            let mut consumer = match next.take() {
                Some(consumer) => consumer,
                None => match Self::setup_consumer(&pool, &queue).await {
                    Ok(consumer) => {
                        info!(queue = %queue, "Consumer reconnected");
                        // Reset backoff on successful connection
                        backoff_iter = backoff_builder.build();
                        consumer
                    }
                    Err(e) => {
                        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            queue = %queue,
                            "Failed to set up consumer, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            // Process messages until stream ends
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        callback(Delivery {
                            routing_key: delivery.routing_key.as_str().to_string(),
                            body: delivery.data,
                        })
                        .await;
                    }
                    Err(e) => {
                        error!(error = %e, queue = %queue, "Consumer delivery error, will reconnect");
                        break;
                    }
                }
            }

            info!(queue = %queue, "Consumer stream ended, reconnecting...");
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let channel = Self::get_channel(&self.pool).await?;
        Self::declare_queue(&channel, queue).await?;

        let confirm = channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if let Err(e) = channel.close(200, "OK").await {
            warn!(error = %e, queue = %queue, "Failed to close publish channel");
        }

        debug!(queue = %queue, bytes = payload.len(), "Published to RabbitMQ");
        Ok(())
    }

    async fn consume(&self, queue: &str, callback: DeliveryCallback) -> Result<()> {
        let consumer = Self::setup_consumer(&self.pool, queue).await?;

        let pool = self.pool.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            Self::consume_with_reconnect(pool, queue, consumer, callback).await;
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options() {
        let options = queue_options();
        assert!(!options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(!options.passive);
    }

    #[test]
    fn test_consume_options_auto_ack() {
        let options = consume_options();
        assert!(options.no_ack);
        assert!(!options.exclusive);
    }
}
