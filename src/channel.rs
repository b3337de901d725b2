//! Per-connection event channel.
//!
//! Decoded frames are fanned out to observers keyed by the message's event
//! symbol. Each observer is a [`Deferred`]; `send` *posts* the event onto the
//! observer's ok path rather than executing it inline, so all observer work
//! runs under the tick worker.

use std::cell::RefCell;

use crate::deferred::{Deferred, Step};
use crate::error::EpcError;
use crate::sexp::Sexp;

/// What an observer listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKey {
    /// Matches every event.
    Any,
    /// Matches one event symbol by name.
    Event(String),
}

impl From<&str> for EventKey {
    fn from(name: &str) -> EventKey {
        EventKey::Event(name.to_owned())
    }
}

impl EventKey {
    fn matches(&self, event: &str) -> bool {
        match self {
            EventKey::Any => true,
            EventKey::Event(name) => name == event,
        }
    }
}

struct Observer {
    key: EventKey,
    sink: Deferred,
}

/// Observer registry for one connection.
pub struct EventChannel {
    name: String,
    observers: RefCell<Vec<Observer>>,
}

impl EventChannel {
    pub fn new(name: impl Into<String>) -> EventChannel {
        EventChannel {
            name: name.into(),
            observers: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an observer; returns its deferred for chaining.
    pub fn connect(&self, key: impl Into<EventKey>) -> Deferred {
        let sink = Deferred::new();
        self.register(key.into(), sink.clone());
        sink
    }

    /// Register an observer pre-armed with a callback.
    pub fn connect_with(
        &self,
        key: impl Into<EventKey>,
        f: impl Fn(Sexp) -> Result<Step, EpcError> + 'static,
    ) -> Deferred {
        let sink = Deferred::with_callback(f);
        self.register(key.into(), sink.clone());
        sink
    }

    fn register(&self, key: EventKey, sink: Deferred) {
        self.observers.borrow_mut().push(Observer { key, sink });
    }

    /// Post `(event . args)` to every matching observer, in registration
    /// order. Returns how many observers matched.
    pub fn send(&self, event: &str, args: Vec<Sexp>) -> usize {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Sexp::symbol(event));
        items.extend(args);
        let message = Sexp::list(items);

        let sinks: Vec<Deferred> = self
            .observers
            .borrow()
            .iter()
            .filter(|observer| observer.key.matches(event))
            .map(|observer| observer.sink.clone())
            .collect();
        for sink in &sinks {
            sink.post_resolve(message.clone());
        }
        sinks.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }
}
