//! Handler registry: the dispatch table behind `EventBus`.
//!
//! Maps each event discriminator to the handlers bound to it and to the
//! concrete event type its payloads decode into. Handlers are stored as
//! factory closures, so every delivery gets a freshly built handler.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::{BusError, EventHandler, HandlerError, HandlerResult, Result};
use crate::message::{self, short_type_name, Event};

/// A decoded event whose concrete type is only known to its `EventType`.
pub type AnyEvent = Box<dyn Any + Send>;

type Decoder = fn(&[u8]) -> serde_json::Result<AnyEvent>;

type Invoker = Arc<dyn Fn(AnyEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Concrete event type registered under a discriminator.
#[derive(Clone)]
pub struct EventType {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: Decoder,
}

impl EventType {
    fn of<E: Event>() -> Self {
        Self {
            name: E::message_type(),
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_boxed::<E>,
        }
    }

    /// Discriminator (queue name).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Full Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a payload into this event type.
    pub fn decode(&self, payload: &[u8]) -> serde_json::Result<AnyEvent> {
        (self.decode)(payload)
    }
}

fn decode_boxed<E: Event>(payload: &[u8]) -> serde_json::Result<AnyEvent> {
    let event: E = message::decode(payload)?;
    Ok(Box::new(event))
}

/// One handler type bound to one event discriminator.
#[derive(Clone)]
pub struct HandlerBinding {
    event: &'static str,
    handler: &'static str,
    handler_type: TypeId,
    invoke: Invoker,
}

impl HandlerBinding {
    fn new<E, H, F>(factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let invoke: Invoker = Arc::new(move |event: AnyEvent| {
            let factory = Arc::clone(&factory);
            // Built inside the future: factory panics must reach dispatch's catch_unwind.
            async move {
                let handler = (*factory)();
                let event = event.downcast::<E>().map_err(|_| -> HandlerError {
                    format!("payload is not a {}", std::any::type_name::<E>()).into()
                })?;
                handler.handle(*event).await
            }
            .boxed()
        });

        Self {
            event: E::message_type(),
            handler: short_type_name::<H>(),
            handler_type: TypeId::of::<H>(),
            invoke,
        }
    }

    /// Discriminator this binding listens on.
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Short name of the handler type.
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    /// Build a fresh handler and run it on `event`.
    ///
    /// Nothing runs until the returned future is polled.
    pub fn invoke(&self, event: AnyEvent) -> BoxFuture<'static, HandlerResult> {
        (self.invoke)(event)
    }
}

/// Everything dispatch needs for one discriminator, detached from the registry.
#[derive(Clone)]
pub struct Route {
    pub event_type: EventType,
    pub bindings: Vec<HandlerBinding>,
}

/// Discriminator → handlers and discriminator → concrete event type.
///
/// Grows monotonically: bindings are never removed.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Vec<HandlerBinding>>,
    event_types: HashMap<&'static str, EventType>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind handler type `H`, built by `factory`, to events of type `E`.
    ///
    /// Fails with `DuplicateRegistration` when `H` is already bound to `E`,
    /// and with `DiscriminatorConflict` when a different type already owns
    /// `E`'s discriminator.
    pub fn register<E, H, F>(&mut self, factory: F) -> Result<()>
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let event = E::message_type();

        match self.event_types.get(event) {
            Some(existing) if existing.type_id != TypeId::of::<E>() => {
                return Err(BusError::DiscriminatorConflict {
                    event: event.to_string(),
                    existing: existing.type_name.to_string(),
                    attempted: std::any::type_name::<E>().to_string(),
                });
            }
            Some(_) => {}
            None => {
                self.event_types.insert(event, EventType::of::<E>());
            }
        }

        let bindings = self.handlers.entry(event).or_default();
        let handler_type = TypeId::of::<H>();
        if bindings.iter().any(|b| b.handler_type == handler_type) {
            return Err(BusError::DuplicateRegistration {
                handler: short_type_name::<H>().to_string(),
                event: event.to_string(),
            });
        }

        bindings.push(HandlerBinding::new::<E, H, F>(factory));
        Ok(())
    }

    /// Handlers bound to `event`, in registration order.
    pub fn bindings(&self, event: &str) -> &[HandlerBinding] {
        self.handlers.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Concrete type registered for `event`.
    pub fn event_type(&self, event: &str) -> Option<&EventType> {
        self.event_types.get(event)
    }

    /// Registered discriminators, sorted.
    pub fn event_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.event_types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of what dispatch needs for `event`, if anything is bound.
    pub fn route(&self, event: &str) -> Option<Route> {
        let bindings = self.handlers.get(event).filter(|b| !b.is_empty())?;
        let event_type = self.event_types.get(event)?;
        Some(Route {
            event_type: event_type.clone(),
            bindings: bindings.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageHeader};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct OrderCreated {
        #[serde(flatten)]
        header: MessageHeader,
        order_id: String,
    }

    impl Message for OrderCreated {}

    impl Event for OrderCreated {
        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    mod legacy {
        use super::*;

        /// Same discriminator as the outer `OrderCreated`, different type.
        #[derive(Debug, Serialize, Deserialize)]
        pub struct OrderCreated {
            #[serde(flatten)]
            pub header: MessageHeader,
        }

        impl Message for OrderCreated {}

        impl Event for OrderCreated {
            fn header(&self) -> &MessageHeader {
                &self.header
            }
        }
    }

    #[derive(Default)]
    struct SendEmailHandler;

    #[async_trait]
    impl EventHandler<OrderCreated> for SendEmailHandler {
        async fn handle(&self, _event: OrderCreated) -> HandlerResult {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ReserveStockHandler;

    #[async_trait]
    impl EventHandler<OrderCreated> for ReserveStockHandler {
        async fn handle(&self, _event: OrderCreated) -> HandlerResult {
            Err("out of stock".into())
        }
    }

    #[async_trait]
    impl EventHandler<legacy::OrderCreated> for SendEmailHandler {
        async fn handle(&self, _event: legacy::OrderCreated) -> HandlerResult {
            Ok(())
        }
    }

    #[test]
    fn test_register_distinct_handlers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, SendEmailHandler, _>(SendEmailHandler::default)
            .unwrap();
        registry
            .register::<OrderCreated, ReserveStockHandler, _>(ReserveStockHandler::default)
            .unwrap();

        let handlers: Vec<_> = registry
            .bindings("OrderCreated")
            .iter()
            .map(HandlerBinding::handler)
            .collect();
        assert_eq!(handlers, vec!["SendEmailHandler", "ReserveStockHandler"]);
        assert_eq!(registry.event_names(), vec!["OrderCreated"]);
    }

    /// The duplicate check compares handler `TypeId`s, so registering the
    /// same handler twice is caught.
    #[test]
    fn test_register_same_handler_twice_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, SendEmailHandler, _>(SendEmailHandler::default)
            .unwrap();

        let err = registry
            .register::<OrderCreated, SendEmailHandler, _>(SendEmailHandler::default)
            .unwrap_err();

        match err {
            BusError::DuplicateRegistration { handler, event } => {
                assert_eq!(handler, "SendEmailHandler");
                assert_eq!(event, "OrderCreated");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.bindings("OrderCreated").len(), 1);
    }

    #[test]
    fn test_discriminator_conflict() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, SendEmailHandler, _>(SendEmailHandler::default)
            .unwrap();

        let err = registry
            .register::<legacy::OrderCreated, SendEmailHandler, _>(SendEmailHandler::default)
            .unwrap_err();

        assert!(matches!(err, BusError::DiscriminatorConflict { .. }));
        assert_eq!(registry.bindings("OrderCreated").len(), 1);
    }

    #[test]
    fn test_route_unknown_event() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.route("OrderCreated").is_none());
        assert!(registry.bindings("OrderCreated").is_empty());
        assert!(registry.event_type("OrderCreated").is_none());
    }

    #[tokio::test]
    async fn test_binding_decodes_and_invokes() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<OrderCreated, ReserveStockHandler, _>(ReserveStockHandler::default)
            .unwrap();

        let event = OrderCreated {
            header: MessageHeader::new::<OrderCreated>(),
            order_id: "123".to_string(),
        };
        let payload = message::encode(&event).unwrap();

        let route = registry.route("OrderCreated").unwrap();
        let decoded = route.event_type.decode(&payload).unwrap();
        let result = route.bindings[0].invoke(decoded).await;

        assert_eq!(result.unwrap_err().to_string(), "out of stock");
    }
}
