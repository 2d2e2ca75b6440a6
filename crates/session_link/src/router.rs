//! Typed routing of inbound socket messages.
//!
//! Each router inspects the cheap [`Envelope`] view first and only decodes
//! the full message into its payload type when the discriminator (or, for
//! error routers, the error code) matches. Messages that fail either step
//! are dropped without notifying anyone.

use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, Weak},
};

use serde::de::DeserializeOwned;
use shared::protocol::Envelope;
use tracing::debug;

use crate::{
    dispatcher::{ConnectionObserver, Dispatcher},
    task::Cancellable,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    Discriminator(String),
    /// Match `payload.code` of the uniform error envelope, whatever the
    /// message's own type.
    ErrorCode(String),
}

impl RouteKey {
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Self::Discriminator(target) => envelope.discriminator() == Some(target.as_str()),
            Self::ErrorCode(target) => envelope.error_code() == Some(target.as_str()),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discriminator(target) => write!(f, "type={target}"),
            Self::ErrorCode(target) => write!(f, "error_code={target}"),
        }
    }
}

pub struct TypedEventRouter<T, F> {
    key: RouteKey,
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> TypedEventRouter<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync,
{
    pub fn new(discriminator: impl Into<String>, handler: F) -> Self {
        Self::with_key(RouteKey::Discriminator(discriminator.into()), handler)
    }

    pub fn for_error_code(code: impl Into<String>, handler: F) -> Self {
        Self::with_key(RouteKey::ErrorCode(code.into()), handler)
    }

    pub fn with_key(key: RouteKey, handler: F) -> Self {
        Self {
            key,
            handler,
            _payload: PhantomData,
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }
}

impl<T, F> ConnectionObserver for TypedEventRouter<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync,
{
    fn on_message(&self, text: &str) {
        let Some(envelope) = Envelope::parse(text) else {
            return;
        };
        if !self.key.matches(&envelope) {
            return;
        }
        match serde_json::from_str::<T>(text) {
            Ok(payload) => (self.handler)(payload),
            Err(err) => debug!(route = %self.key, %err, "router: payload decode failed"),
        }
    }
}

pub struct Subscription {
    dispatcher: Weak<Dispatcher>,
    observer: Arc<dyn ConnectionObserver>,
}

impl Subscription {
    pub fn new(dispatcher: &Arc<Dispatcher>, observer: Arc<dyn ConnectionObserver>) -> Self {
        dispatcher.add(observer.clone());
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            observer,
        }
    }

    pub fn observer(&self) -> &Arc<dyn ConnectionObserver> {
        &self.observer
    }
}

impl Cancellable for Subscription {
    fn cancel(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(&self.observer);
        }
    }
}

/// Route messages whose discriminator equals `discriminator` to `handler`.
pub fn register<T, F>(
    dispatcher: &Arc<Dispatcher>,
    discriminator: impl Into<String>,
    handler: F,
) -> Subscription
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Subscription::new(
        dispatcher,
        Arc::new(TypedEventRouter::new(discriminator, handler)),
    )
}

pub fn register_error<T, F>(
    dispatcher: &Arc<Dispatcher>,
    code: impl Into<String>,
    handler: F,
) -> Subscription
where
    T: DeserializeOwned + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Subscription::new(
        dispatcher,
        Arc::new(TypedEventRouter::for_error_code(code, handler)),
    )
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
