//! Subscription registry for asynchronous node events.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::HeadUpdate;

/// Receives a notification each time the beacon chain head moves.
#[async_trait]
pub trait HeadUpdateHandler: Send + Sync {
    async fn on_head_update(&self, update: HeadUpdate);
}

/// Ordered collection of head update subscriptions, shared between the
/// notification path and subscribers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn HeadUpdateHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Handlers are notified in subscription order and
    /// are never deduplicated.
    pub fn subscribe(&self, handler: Arc<dyn HeadUpdateHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Delivers `update` to a snapshot of the current subscriptions. The
    /// lock is released before any handler runs, so a slow or panicking
    /// handler cannot block subscribers or corrupt the collection.
    pub async fn notify(&self, update: &HeadUpdate) {
        let snapshot: Vec<Arc<dyn HeadUpdateHandler>> = self.handlers.read().clone();
        for handler in snapshot {
            handler.on_head_update(update.clone()).await;
        }
    }

    /// Drops every subscription. Used during service teardown; safe to call
    /// repeatedly.
    pub fn clear(&self) {
        *self.handlers.write() = Vec::new();
    }
}
