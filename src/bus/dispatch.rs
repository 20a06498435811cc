//! Delivery dispatch.
//!
//! Resolves a delivered message's discriminator to its handlers, decodes the
//! body into the registered event type and runs every handler on it.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error};

use super::registry::{HandlerBinding, HandlerRegistry, Route};
use super::BusError;

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Every bound handler succeeded.
    Success { handled: usize },
    /// At least one handler failed or panicked; the others still ran.
    HandlerFailed { handled: usize, failed: usize },
    /// Nothing is bound to the discriminator. Not an error.
    Unroutable,
    /// The body does not decode into the registered event type.
    DecodeError,
}

impl DispatchResult {
    /// Returns true if all handlers succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Dispatch a raw message to every handler bound to `discriminator`.
///
/// The registry lock is held only while the route is copied out; handlers
/// run after it is released. Handlers run in registration order, each on
/// its own decoded copy of the event. A failing or panicking handler is
/// logged and does not stop the rest.
pub async fn dispatch(
    registry: &RwLock<HandlerRegistry>,
    discriminator: &str,
    payload: &[u8],
) -> DispatchResult {
    let route = registry.read().await.route(discriminator);
    let Some(route) = route else {
        debug!(event = %discriminator, "No handlers registered, dropping message");
        return DispatchResult::Unroutable;
    };

    dispatch_route(&route, payload).await
}

/// Dispatch to an already resolved route.
///
/// A body that does not decode is dropped before any handler runs.
pub async fn dispatch_route(route: &Route, payload: &[u8]) -> DispatchResult {
    let mut first = match route.event_type.decode(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            error!(
                event = %route.event_type.name(),
                error = %e,
                "Failed to decode message"
            );
            return DispatchResult::DecodeError;
        }
    };

    let mut failed = 0;

    for binding in &route.bindings {
        // Every handler after the first gets its own copy.
        let event = match first.take() {
            Some(event) => event,
            None => match route.event_type.decode(payload) {
                Ok(event) => event,
                Err(e) => {
                    error!(handler = %binding.handler(), error = %e, "Failed to decode message");
                    failed += 1;
                    continue;
                }
            },
        };

        if let Err(e) = invoke(binding, event).await {
            error!(error = %e, "Handler failed");
            failed += 1;
        }
    }

    let handled = route.bindings.len();
    debug!(event = %route.event_type.name(), handled, failed, "Dispatched message");

    if failed == 0 {
        DispatchResult::Success { handled }
    } else {
        DispatchResult::HandlerFailed { handled, failed }
    }
}

/// Run one handler, turning errors and panics into `HandlerFailed`.
async fn invoke(binding: &HandlerBinding, event: Box<dyn Any + Send>) -> Result<(), BusError> {
    let failure = |message: String| BusError::HandlerFailed {
        handler: binding.handler().to_string(),
        event: binding.event().to_string(),
        message,
    };

    match AssertUnwindSafe(binding.invoke(event)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(failure(e.to_string())),
        Err(panic) => Err(failure(format!("panicked: {}", panic_message(&*panic)))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventHandler, HandlerResult};
    use crate::message::{self, Event, Message, MessageHeader};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct OrderCreated {
        #[serde(flatten)]
        header: MessageHeader,
        order_id: String,
        amount: f64,
    }

    impl Message for OrderCreated {}

    impl Event for OrderCreated {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    struct RecordingHandler {
        seen: Arc<std::sync::Mutex<Vec<OrderCreated>>>,
    }

    #[async_trait]
    impl EventHandler<OrderCreated> for RecordingHandler {
        async fn handle(&self, event: OrderCreated) -> HandlerResult {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler<OrderCreated> for FailingHandler {
        async fn handle(&self, _event: OrderCreated) -> HandlerResult {
            Err("smtp unavailable".into())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler<OrderCreated> for PanickingHandler {
        async fn handle(&self, _event: OrderCreated) -> HandlerResult {
            panic!("handler bug");
        }
    }

    fn order() -> OrderCreated {
        OrderCreated {
            header: MessageHeader::new::<OrderCreated>(),
            order_id: "123".to_string(),
            amount: 42.5,
        }
    }

    fn recording(
        registry: &mut HandlerRegistry,
    ) -> Arc<std::sync::Mutex<Vec<OrderCreated>>> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let shared = seen.clone();
        registry
            .register::<OrderCreated, RecordingHandler, _>(move || RecordingHandler {
                seen: shared.clone(),
            })
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn test_dispatch_unroutable() {
        let registry = RwLock::new(HandlerRegistry::new());

        let result = dispatch(&registry, "OrderShipped", b"{}").await;

        assert_eq!(result, DispatchResult::Unroutable);
    }

    #[tokio::test]
    async fn test_dispatch_reconstructs_event() {
        let mut registry = HandlerRegistry::new();
        let seen = recording(&mut registry);
        let registry = RwLock::new(registry);

        let event = order();
        let payload = message::encode(&event).unwrap();
        let result = dispatch(&registry, "OrderCreated", &payload).await;

        assert_eq!(result, DispatchResult::Success { handled: 1 });
        assert_eq!(seen.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_stop_other_handlers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, FailingHandler, _>(|| FailingHandler)
            .unwrap();
        let seen = recording(&mut registry);
        let registry = RwLock::new(registry);

        let payload = message::encode(&order()).unwrap();
        let result = dispatch(&registry, "OrderCreated", &payload).await;

        assert_eq!(
            result,
            DispatchResult::HandlerFailed {
                handled: 2,
                failed: 1
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_panic_does_not_stop_other_handlers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, PanickingHandler, _>(|| PanickingHandler)
            .unwrap();
        let seen = recording(&mut registry);
        let registry = RwLock::new(registry);

        let payload = message::encode(&order()).unwrap();
        let result = dispatch(&registry, "OrderCreated", &payload).await;

        assert!(!result.is_success());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_factory_panic_does_not_stop_other_handlers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, FailingHandler, _>(|| -> FailingHandler {
                panic!("missing smtp settings")
            })
            .unwrap();
        let seen = recording(&mut registry);
        let registry = RwLock::new(registry);

        let payload = message::encode(&order()).unwrap();
        let result = dispatch(&registry, "OrderCreated", &payload).await;

        assert_eq!(
            result,
            DispatchResult::HandlerFailed {
                handled: 2,
                failed: 1
            }
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_builds_fresh_handler_per_message() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, FailingHandler, _>(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                FailingHandler
            })
            .unwrap();
        let registry = RwLock::new(registry);

        let payload = message::encode(&order()).unwrap();
        dispatch(&registry, "OrderCreated", &payload).await;
        dispatch(&registry, "OrderCreated", &payload).await;

        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_decode_error() {
        let mut registry = HandlerRegistry::new();
        let seen = recording(&mut registry);
        let registry = RwLock::new(registry);

        let result = dispatch(&registry, "OrderCreated", b"not json").await;

        assert_eq!(result, DispatchResult::DecodeError);
        assert!(seen.lock().unwrap().is_empty());
    }
}
