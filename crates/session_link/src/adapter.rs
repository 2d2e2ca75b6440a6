use std::sync::Arc;

use crate::dispatcher::ConnectionObserver;

/// Connection status as seen by the owner of a session.
pub trait SessionStateListener: Send + Sync {
    fn on_connected(&self);
    fn on_unexpected_disconnect(&self, reason: &str);
}

/// Reports transport lifecycle to a [`SessionStateListener`]. Holds no
/// state of its own; closing events are left to the reconnect machinery.
pub struct StateReportingAdapter {
    listener: Arc<dyn SessionStateListener>,
}

impl StateReportingAdapter {
    pub fn new(listener: Arc<dyn SessionStateListener>) -> Self {
        Self { listener }
    }
}

impl ConnectionObserver for StateReportingAdapter {
    fn on_open(&self) {
        self.listener.on_connected();
    }

    fn on_failure(&self, reason: &str) {
        self.listener.on_unexpected_disconnect(reason);
    }
}
