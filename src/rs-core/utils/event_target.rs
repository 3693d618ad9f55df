use std::collections::VecDeque;

/// Identifier returned by `Subscribable::on`, to give back to `Subscribable::off`.
pub type ListenerId = u64;

/// Name given to `Subscribable::on` to be notified of every event.
pub const ALL_EVENTS: &str = "*";

/// An event which can be dispatched through an `EventTarget`.
pub trait Event {
    /// Name of the event, as listeners register to it.
    fn name(&self) -> &'static str;
}

/// Capability of emitting events of type `E` to registered listeners.
pub trait Subscribable<E: Event> {
    /// Register `listener` for events named `name` (or `ALL_EVENTS`).
    fn on<F>(&mut self, name: &'static str, listener: F) -> ListenerId
    where
        F: FnMut(&E) + 'static;

    /// Remove a listener previously registered with `on`.
    ///
    /// Returns `false` if no listener was registered with that id.
    fn off(&mut self, id: ListenerId) -> bool;

    /// Dispatch `event` to its listeners.
    fn trigger(&mut self, event: E);
}

struct Listener<E> {
    id: ListenerId,
    name: &'static str,
    callback: Box<dyn FnMut(&E)>,
}

/// Basic `Subscribable` implementation, composed into every component emitting events.
///
/// A "queued" `EventTarget` additionally keeps every triggered event until its owner drains
/// them. This is how components report to whoever owns them without keeping a reference to
/// it: the owner drains the queue once the component's method returned.
pub struct EventTarget<E> {
    listeners: Vec<Listener<E>>,
    next_id: ListenerId,
    queue: Option<VecDeque<E>>,
}

impl<E: Event> EventTarget<E> {
    /// Create an `EventTarget` only notifying its listeners.
    pub fn new() -> Self {
        Self {
            listeners: vec![],
            next_id: 0,
            queue: None,
        }
    }

    /// Create an `EventTarget` which also queues every event until `drain` is called.
    pub fn queued() -> Self {
        Self {
            listeners: vec![],
            next_id: 0,
            queue: Some(VecDeque::new()),
        }
    }

    /// Take all events queued since the last call.
    pub fn drain(&mut self) -> Vec<E> {
        match self.queue.as_mut() {
            Some(queue) => queue.drain(..).collect(),
            None => vec![],
        }
    }

    /// Returns `true` if queued events are waiting to be drained.
    pub fn has_pending(&self) -> bool {
        self.queue.as_ref().map_or(false, |q| !q.is_empty())
    }

    /// Remove every listener and queued event.
    pub fn clear(&mut self) {
        self.listeners.clear();
        if let Some(queue) = self.queue.as_mut() {
            queue.clear();
        }
    }
}

impl<E: Event> Default for EventTarget<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Subscribable<E> for EventTarget<E> {
    fn on<F>(&mut self, name: &'static str, listener: F) -> ListenerId
    where
        F: FnMut(&E) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push(Listener {
            id,
            name,
            callback: Box::new(listener),
        });
        id
    }

    fn off(&mut self, id: ListenerId) -> bool {
        let len_before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != len_before
    }

    fn trigger(&mut self, event: E) {
        let name = event.name();
        for listener in self
            .listeners
            .iter_mut()
            .filter(|l| l.name == name || l.name == ALL_EVENTS)
        {
            (listener.callback)(&event);
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.push_back(event);
        }
    }
}

/// Implement `Subscribable` for a component by forwarding to one of its `EventTarget` fields.
macro_rules! forward_subscribable {
    ($component:ty, $event:ty, $field:ident) => {
        impl $crate::utils::event_target::Subscribable<$event> for $component {
            fn on<F>(
                &mut self,
                name: &'static str,
                listener: F,
            ) -> $crate::utils::event_target::ListenerId
            where
                F: FnMut(&$event) + 'static,
            {
                self.$field.on(name, listener)
            }

            fn off(&mut self, id: $crate::utils::event_target::ListenerId) -> bool {
                self.$field.off(id)
            }

            fn trigger(&mut self, event: $event) {
                self.$field.trigger(event)
            }
        }
    };
}
pub(crate) use forward_subscribable;

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Debug, PartialEq)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl Event for TestEvent {
        fn name(&self) -> &'static str {
            match self {
                TestEvent::Ping(_) => "ping",
                TestEvent::Pong => "pong",
            }
        }
    }

    #[test]
    fn dispatches_by_name_and_wildcard() {
        let seen = Rc::new(RefCell::new(vec![]));
        let mut target = EventTarget::new();
        let s = seen.clone();
        target.on("ping", move |e: &TestEvent| {
            if let TestEvent::Ping(n) = e {
                s.borrow_mut().push(format!("ping {n}"));
            }
        });
        let s = seen.clone();
        let all = target.on(ALL_EVENTS, move |e: &TestEvent| {
            s.borrow_mut().push(format!("any {}", e.name()));
        });
        target.trigger(TestEvent::Ping(1));
        target.trigger(TestEvent::Pong);
        assert!(target.off(all));
        assert!(!target.off(all));
        target.trigger(TestEvent::Ping(2));
        assert_eq!(
            *seen.borrow(),
            vec!["ping 1", "any ping", "any pong", "ping 2"]
        );
        assert!(target.drain().is_empty());
    }

    #[test]
    fn queued_target_keeps_events_until_drained() {
        let mut target = EventTarget::queued();
        target.trigger(TestEvent::Ping(3));
        target.trigger(TestEvent::Pong);
        assert!(target.has_pending());
        assert_eq!(target.drain(), vec![TestEvent::Ping(3), TestEvent::Pong]);
        assert!(!target.has_pending());
    }
}
