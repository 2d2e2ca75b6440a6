use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use tracing::error;

/// Capability interface for anything interested in connection lifecycle
/// events. Every method defaults to a no-op.
pub trait ConnectionObserver: Send + Sync {
    fn on_open(&self) {}

    fn on_message(&self, _text: &str) {}

    fn on_closing(&self, _code: u16, _reason: &str) {}

    fn on_closed(&self, _code: u16, _reason: &str) {}

    /// The connection failed to open, or dropped without a Close frame.
    fn on_failure(&self, _reason: &str) {}
}

/// Fans every raw connection event out to a mutable set of observers.
///
/// Observers may be added or removed at any time, including from inside a
/// callback; each event is delivered to a snapshot of the set taken when the
/// event arrives. Delivery order is unspecified.
#[derive(Default)]
pub struct Dispatcher {
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn ConnectionObserver>) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !observers.iter().any(|known| same_observer(known, &observer)) {
            observers.push(observer);
        }
    }

    pub fn remove(&self, observer: &Arc<dyn ConnectionObserver>) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|known| !same_observer(known, observer));
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch_open(&self) {
        self.fan_out("open", |observer| observer.on_open());
    }

    pub fn dispatch_message(&self, text: &str) {
        self.fan_out("message", |observer| observer.on_message(text));
    }

    pub fn dispatch_closing(&self, code: u16, reason: &str) {
        self.fan_out("closing", |observer| observer.on_closing(code, reason));
    }

    pub fn dispatch_closed(&self, code: u16, reason: &str) {
        self.fan_out("closed", |observer| observer.on_closed(code, reason));
    }

    pub fn dispatch_failure(&self, reason: &str) {
        self.fan_out("failure", |observer| observer.on_failure(reason));
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn fan_out(&self, event: &'static str, deliver: impl Fn(&dyn ConnectionObserver)) {
        for observer in self.snapshot() {
            // One misbehaving observer must not starve the rest.
            if catch_unwind(AssertUnwindSafe(|| deliver(observer.as_ref()))).is_err() {
                error!(event, "dispatcher: observer panicked during delivery");
            }
        }
    }
}

// Compare data pointers only; vtable pointers for the same object may differ
// across codegen units.
pub(crate) fn same_observer(
    a: &Arc<dyn ConnectionObserver>,
    b: &Arc<dyn ConnectionObserver>,
) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
