//! Explicit event registry with deterministic, insertion-ordered delivery.
//!
//! Owned by the component that raises the event; no global registration.

pub struct EventRegistry<T> {
    listeners: Vec<Box<dyn FnMut(&T)>>,
}

impl<T> EventRegistry<T> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn subscribe(&mut self, listener: impl FnMut(&T) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&mut self, event: &T) {
        for listener in &mut self.listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
