//! Typed event bus shared by every consumer-facing component.
//!
//! Each component declares its own event enum and owns an
//! [`EventBus`] parameterized by it. Listeners run synchronously, in
//! subscription order, before `emit` returns.

use std::fmt;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// A `{target, kind}` event record.
///
/// `target` identifies the component that emitted the event; `kind`
/// carries the event type and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T, K> {
    pub target: T,
    pub kind: K,
}

impl<T, K> Event<T, K> {
    pub fn new(target: T, kind: K) -> Self {
        Self { target, kind }
    }
}

type Listener<E> = Box<dyn FnMut(&E)>;

/// Synchronous, single-threaded publish/subscribe channel for one event type.
///
/// # Example
///
/// ```
/// use imagekeep_core::EventBus;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let seen = Rc::new(RefCell::new(Vec::new()));
/// let mut bus = EventBus::new();
///
/// let sink = Rc::clone(&seen);
/// let id = bus.subscribe(move |event: &u32| sink.borrow_mut().push(*event));
///
/// bus.emit(&1);
/// bus.unsubscribe(id);
/// bus.emit(&2);
///
/// assert_eq!(*seen.borrow(), vec![1]);
/// ```
pub struct EventBus<E> {
    listeners: Vec<(SubscriptionId, Listener<E>)>,
    next_id: u64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 0,
        }
    }

    /// Register a listener; it receives every event emitted afterwards.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&E) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Deliver `event` to every listener in subscription order.
    pub fn emit(&mut self, event: &E) {
        for (_, listener) in &mut self.listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Drop every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_listeners_run_in_subscription_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();

        for tag in ["first", "second"] {
            let log = Rc::clone(&log);
            bus.subscribe(move |event: &Event<u8, &'static str>| {
                log.borrow_mut().push((tag, event.target, event.kind));
            });
        }

        bus.emit(&Event::new(7, "progress"));

        assert_eq!(
            *log.borrow(),
            vec![("first", 7, "progress"), ("second", 7, "progress")]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let count = Rc::new(RefCell::new(0));
        let mut bus = EventBus::new();

        let counter = Rc::clone(&count);
        let id = bus.subscribe(move |_: &()| *counter.borrow_mut() += 1);

        bus.emit(&());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&());

        assert_eq!(*count.borrow(), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let mut bus: EventBus<()> = EventBus::default();
        let a = bus.subscribe(|_| {});
        let b = bus.subscribe(|_| {});

        assert_ne!(a, b);
        assert_eq!(bus.len(), 2);
        bus.clear();
        assert!(bus.is_empty());
    }
}
