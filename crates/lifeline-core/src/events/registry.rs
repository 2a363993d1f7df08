//! Event subscriptions
//!
//! Handlers are registered per event type or for all events. Registration
//! returns a [`Subscription`]; dropping it is the only way to stop delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::ServerEvent;

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    typed: HashMap<String, Vec<(u64, Handler)>>,
    any: Vec<(u64, Handler)>,
}

impl Handlers {
    fn lock(inner: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
        inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Typed(String),
    Any,
}

/// Fan-out table from event type to handlers
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<Mutex<Handlers>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of exactly `event_type`
    pub fn on_event<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut handlers = Handlers::lock(&self.inner);
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers
            .typed
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        self.subscription(id, Slot::Typed(event_type.to_string()))
    }

    /// Call `handler` for every event
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut handlers = Handlers::lock(&self.inner);
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers.any.push((id, Arc::new(handler)));
        self.subscription(id, Slot::Any)
    }

    /// Hand `event` to its type's handlers, then to catch-all handlers
    ///
    /// Returns how many handlers ran. Handlers are called without the
    /// registry lock held, so they may subscribe or unsubscribe.
    pub fn deliver(&self, event: &ServerEvent) -> usize {
        let targets: Vec<Handler> = {
            let handlers = Handlers::lock(&self.inner);
            handlers
                .typed
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(handlers.any.iter())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in &targets {
            handler(event);
        }
        targets.len()
    }

    pub fn handler_count(&self) -> usize {
        let handlers = Handlers::lock(&self.inner);
        handlers.typed.values().map(Vec::len).sum::<usize>() + handlers.any.len()
    }

    fn subscription(&self, id: u64, slot: Slot) -> Subscription {
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
            slot,
        }
    }
}

/// Keeps a handler registered until dropped
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Mutex<Handlers>>,
    id: u64,
    slot: Slot,
}

impl Subscription {
    /// Stop receiving events now
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut handlers = Handlers::lock(&inner);
        match &self.slot {
            Slot::Typed(event_type) => {
                if let Some(list) = handlers.typed.get_mut(event_type) {
                    list.retain(|(id, _)| *id != self.id);
                    if list.is_empty() {
                        handlers.typed.remove(event_type);
                    }
                }
            }
            Slot::Any => handlers.any.retain(|(id, _)| *id != self.id),
        }
    }
}
