use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::consumer::{DeliveryContext, MessageHandler, Outcome};
use crate::error::HandlerError;
use crate::message::Message;

/// Dispatches deliveries to handlers by message type.
///
/// A delivery whose type has no route fails with `UnknownMessageType` and is
/// rejected by the dispatcher.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `message_type` to `handler`, replacing any previous route.
    pub fn route<H>(self, message_type: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.route_arc(message_type, Arc::new(handler))
    }

    /// Routes `message_type` to a shared handler.
    pub fn route_arc(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.routes.insert(message_type.into(), handler);
        self
    }

    /// Returns true if a handler is registered for `message_type`.
    pub fn handles(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Returns the registered message types, sorted.
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, message: &Message, ctx: &DeliveryContext) -> Result<Outcome, HandlerError> {
        match self.routes.get(&message.message_type) {
            Some(handler) => handler.handle(message, ctx).await,
            None => Err(HandlerError::UnknownMessageType(
                message.message_type.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler_fn;

    #[test]
    fn test_routes_are_registered() {
        let router = Router::new()
            .route("order.created", handler_fn(|_, _| async { Ok(Outcome::Ack) }))
            .route("order.cancelled", handler_fn(|_, _| async { Ok(Outcome::Ack) }));

        assert!(router.handles("order.created"));
        assert!(!router.handles("order.shipped"));
        assert_eq!(
            router.message_types(),
            vec!["order.cancelled", "order.created"]
        );
    }
}
