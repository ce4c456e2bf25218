//! Listener registry for component lifecycle events.

use std::sync::Arc;

/// Receives events of type `E`.
pub trait EventListener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// A function-based listener.
pub struct FnListener<F> {
    f: F,
}

/// Lifts a closure into an [`EventListener`].
pub fn listener<F>(f: F) -> FnListener<F> {
    FnListener { f }
}

impl<E, F> EventListener<E> for FnListener<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

/// A collection of listeners.
///
/// User-supplied listeners run on the data path; a panicking listener is
/// caught so the remaining listeners still run and the path stays safe.
pub struct EventListeners<E> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        EventListeners {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        EventListeners::new()
    }
}

impl<E> EventListeners<E> {
    pub fn new() -> EventListeners<E> {
        EventListeners {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_every_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        for _ in 0..3 {
            let count = Arc::clone(&count);
            listeners.add(listener(move |_: &u32| {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        listeners.emit(&7);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_rest() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = EventListeners::new();
        listeners.add(listener(|_: &u32| panic!("bad listener")));
        let c = Arc::clone(&count);
        listeners.add(listener(move |_: &u32| {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        listeners.emit(&7);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
