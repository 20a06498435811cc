//! The event bus: publish, subscribe and consume over a `Broker`.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatch::{self, DispatchResult};
use super::registry::HandlerRegistry;
use super::{Broker, BusError, Delivery, DeliveryCallback, EventHandler, Result};
use crate::mediator::Mediator;
use crate::message::{self, short_type_name, Command, Event};

/// Publishes events to per-type queues and dispatches consumed messages to
/// registered handlers.
///
/// Lifecycle: build with a broker, `subscribe` handlers, then
/// `start_consuming` (or `start_all`). Subscribing never starts consumption.
/// Handlers may still be added once consumption is running; they see
/// messages delivered after they were bound.
///
/// Consumption acknowledges messages on delivery, so a message whose
/// handlers fail is not redelivered.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    registry: Arc<RwLock<HandlerRegistry>>,
    consuming: Mutex<HashSet<String>>,
    mediator: Option<Arc<dyn Mediator>>,
}

impl EventBus {
    /// Create a bus with an empty registry on top of `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            registry: Arc::new(RwLock::new(HandlerRegistry::new())),
            consuming: Mutex::new(HashSet::new()),
            mediator: None,
        }
    }

    /// Attach a mediator for handler factories to share.
    pub fn with_mediator(mut self, mediator: Arc<dyn Mediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    pub fn mediator(&self) -> Option<Arc<dyn Mediator>> {
        self.mediator.clone()
    }

    /// Serialize `event` and publish it to the queue named after its type.
    ///
    /// Broker failures are returned as-is; nothing is retried.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event = %E::message_type()))]
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let queue = E::message_type();
        let payload = message::encode(event)?;

        self.broker.publish(queue, &payload).await?;

        debug!(queue = %queue, bytes = payload.len(), "Published event");
        Ok(())
    }

    /// Sending commands is not supported. Always fails with `Unsupported`
    /// and never touches the broker.
    pub async fn send_command<C: Command>(&self, _command: &C) -> Result<()> {
        Err(BusError::Unsupported {
            operation: "send_command",
            message_type: C::message_type().to_string(),
        })
    }

    /// Bind handler `H` to events of type `E`; `H` is built with `Default`
    /// for every delivery.
    pub async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: Event,
        H: EventHandler<E> + Default + 'static,
    {
        self.subscribe_with::<E, H, _>(H::default).await
    }

    /// Bind handler `H` to events of type `E`; `factory` builds a handler
    /// for every delivery.
    pub async fn subscribe_with<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.write().await.register::<E, H, F>(factory)?;

        info!(
            event = %E::message_type(),
            handler = %short_type_name::<H>(),
            "Subscribed handler"
        );
        Ok(())
    }

    /// Start consuming the queue for events of type `E`.
    ///
    /// Starting a queue that is already consumed is a no-op.
    pub async fn start_consuming<E: Event>(&self) -> Result<()> {
        self.start_queue(E::message_type()).await
    }

    /// Start consuming every subscribed event type not yet consumed.
    pub async fn start_all(&self) -> Result<()> {
        let events = self.registry.read().await.event_names();
        for event in events {
            self.start_queue(event).await?;
        }
        Ok(())
    }

    /// Whether a consumer is running for `queue`.
    pub async fn is_consuming(&self, queue: &str) -> bool {
        self.consuming.lock().await.contains(queue)
    }

    /// Dispatch a raw message as if the broker had delivered it.
    pub async fn dispatch(&self, discriminator: &str, payload: &[u8]) -> DispatchResult {
        dispatch::dispatch(&self.registry, discriminator, payload).await
    }

    async fn start_queue(&self, queue: &str) -> Result<()> {
        let mut consuming = self.consuming.lock().await;
        if consuming.contains(queue) {
            debug!(queue = %queue, "Already consuming");
            return Ok(());
        }

        if self.registry.read().await.bindings(queue).is_empty() {
            warn!(queue = %queue, "Consuming a queue with no handlers, messages will be dropped");
        }

        let registry = Arc::clone(&self.registry);
        let callback: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let registry = Arc::clone(&registry);
            async move {
                let consume_span =
                    tracing::info_span!("bus.consume", routing_key = %delivery.routing_key);
                let dispatched = AssertUnwindSafe(dispatch::dispatch(
                    &registry,
                    &delivery.routing_key,
                    &delivery.body,
                ))
                .catch_unwind()
                .instrument(consume_span)
                .await;

                // The broker's consume loop must survive any delivery.
                if let Err(panic) = dispatched {
                    error!(
                        routing_key = %delivery.routing_key,
                        panic = %dispatch::panic_message(&*panic),
                        "Dispatch panicked, message dropped"
                    );
                }
            }
            .boxed()
        });

        self.broker.consume(queue, callback).await?;
        consuming.insert(queue.to_string());

        info!(queue = %queue, "Started consuming");
        Ok(())
    }
}
