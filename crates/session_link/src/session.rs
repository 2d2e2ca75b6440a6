//! One resilient connection: a transport factory, the reconnect state
//! machine and the observers that must follow the session across
//! reconnects.

use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, Weak},
    time::Duration,
};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use shared::protocol::NORMAL_CLOSURE;
use tokio::sync::broadcast;
use tracing::{debug, info};
use url::Url;

use crate::{
    adapter::{SessionStateListener, StateReportingAdapter},
    config::LinkSettings,
    dispatcher::{same_observer, ConnectionObserver, Dispatcher},
    error::LinkError,
    reconnect::{ConnectionStateMachine, ReconnectListener, ReconnectPolicy},
    router::TypedEventRouter,
    task::Cancellable,
    transport::{ConnectionHandle, TransportFactory},
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectsExhausted { attempts: u32 },
    Closed { code: u16, reason: String },
}

pub struct LinkSession {
    shared: Arc<SessionShared>,
    machine: ConnectionStateMachine,
}

struct SessionShared {
    factory: TransportFactory,
    machine: OnceLock<ConnectionStateMachine>,
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
    current: Mutex<Option<LiveConnection>>,
    events: broadcast::Sender<SessionEvent>,
}

struct LiveConnection {
    handle: Arc<ConnectionHandle>,
    dispatcher: Arc<Dispatcher>,
}

impl LinkSession {
    pub fn new(
        factory: TransportFactory,
        policy: ReconnectPolicy,
        listener: Option<Arc<dyn SessionStateListener>>,
    ) -> Result<Self, LinkError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reporter = Arc::new(EventReporter {
            events: events.clone(),
        });

        let mut observers: Vec<Arc<dyn ConnectionObserver>> = vec![reporter.clone()];
        if let Some(listener) = listener {
            observers.push(Arc::new(StateReportingAdapter::new(listener)));
        }

        let shared = Arc::new(SessionShared {
            factory,
            machine: OnceLock::new(),
            observers: Mutex::new(observers),
            current: Mutex::new(None),
            events,
        });

        let weak = Arc::downgrade(&shared);
        let machine = ConnectionStateMachine::builder(Arc::new(move || reconnect(&weak)))
            .policy(policy)
            .listener(reporter)
            .build()?;
        let _ = shared.machine.set(machine.clone());

        Ok(Self { shared, machine })
    }

    pub fn from_settings(
        settings: &LinkSettings,
        listener: Option<Arc<dyn SessionStateListener>>,
    ) -> Result<Self, LinkError> {
        let factory = TransportFactory::new(
            &settings.identity(),
            &settings.protocol_info(),
            settings.transport_config(),
        )?;
        Self::new(factory, settings.reconnect_policy()?, listener)
    }

    /// Open the first connection. Calling it again replaces the current
    /// transport.
    pub fn start(&self) -> Result<(), LinkError> {
        if self.machine.is_shut_down() {
            return Err(LinkError::ConnectionClosed);
        }
        self.shared.open_connection();
        Ok(())
    }

    pub fn url(&self) -> &Url {
        self.shared.factory.url()
    }

    pub fn machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.current)
            .as_ref()
            .is_some_and(|live| live.handle.is_open())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Route messages whose discriminator is `discriminator`, decoded as
    /// `T`, to `handler` on every connection of this session.
    pub fn on_event<T, F>(
        &self,
        discriminator: impl Into<String>,
        handler: F,
    ) -> SessionSubscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.observe(Arc::new(TypedEventRouter::new(discriminator, handler)))
    }

    pub fn on_error<T, F>(&self, code: impl Into<String>, handler: F) -> SessionSubscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.observe(Arc::new(TypedEventRouter::for_error_code(code, handler)))
    }

    pub fn observe(&self, observer: Arc<dyn ConnectionObserver>) -> SessionSubscription {
        let mut observers = lock(&self.shared.observers);
        if !observers.iter().any(|known| same_observer(known, &observer)) {
            observers.push(observer.clone());
        }
        if let Some(live) = lock(&self.shared.current).as_ref() {
            live.dispatcher.add(observer.clone());
        }
        SessionSubscription {
            session: Arc::downgrade(&self.shared),
            observer,
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), LinkError> {
        match lock(&self.shared.current).as_ref() {
            Some(live) => live.handle.send_text(text),
            None => Err(LinkError::NotConnected),
        }
    }

    /// Stop reconnecting, then close the current connection normally.
    pub fn shutdown(&self) {
        if self.machine.is_shut_down() {
            return;
        }
        self.machine.shutdown();
        let current = lock(&self.shared.current)
            .as_ref()
            .map(|live| Arc::clone(&live.handle));
        if let Some(handle) = current {
            if handle.is_open() {
                let _ = handle.close(NORMAL_CLOSURE, "session shutdown");
            } else {
                handle.abort();
            }
        }
        info!(url = %self.url(), "link: session shut down");
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionShared {
    fn open_connection(&self) -> Arc<ConnectionHandle> {
        let dispatcher = Arc::new(Dispatcher::new());
        // Holding the observer list keeps registration and reconnect from
        // interleaving.
        let observers = lock(&self.observers);
        for observer in observers.iter() {
            dispatcher.add(observer.clone());
        }
        if let Some(machine) = self.machine.get() {
            dispatcher.add(Arc::new(machine.clone()));
        }

        let handle = Arc::new(self.factory.open_with(Arc::clone(&dispatcher)));
        let previous = lock(&self.current).replace(LiveConnection {
            handle: Arc::clone(&handle),
            dispatcher,
        });
        drop(observers);

        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(url = %self.factory.url(), "link: transport opened");
        handle
    }
}

fn reconnect(session: &Weak<SessionShared>) -> anyhow::Result<Box<dyn Cancellable>> {
    let session = session
        .upgrade()
        .ok_or_else(|| anyhow!("session dropped"))?;
    Ok(Box::new(session.open_connection()))
}

pub struct SessionSubscription {
    session: Weak<SessionShared>,
    observer: Arc<dyn ConnectionObserver>,
}

impl Cancellable for SessionSubscription {
    fn cancel(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut observers = lock(&session.observers);
        observers.retain(|known| !same_observer(known, &self.observer));
        if let Some(live) = lock(&session.current).as_ref() {
            live.dispatcher.remove(&self.observer);
        };
    }
}

struct EventReporter {
    events: broadcast::Sender<SessionEvent>,
}

impl EventReporter {
    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl ConnectionObserver for EventReporter {
    fn on_open(&self) {
        self.emit(SessionEvent::Connected);
    }

    fn on_closed(&self, code: u16, reason: &str) {
        self.emit(SessionEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_failure(&self, reason: &str) {
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

impl ReconnectListener for EventReporter {
    fn on_unexpected_disconnect(&self, reason: &str) {
        debug!(reason, "link: failed before first open, not reconnecting");
    }

    fn on_reconnect_scheduled(&self, attempt: u32, delay: Duration) {
        self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
    }

    fn on_reconnects_exhausted(&self, attempts: u32) {
        self.emit(SessionEvent::ReconnectsExhausted { attempts });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
