//! Client side of a resilient full-duplex session link: a WebSocket
//! transport whose lifecycle events fan out to observers, typed routing of
//! JSON event envelopes, and a reconnect state machine with capped,
//! jittered exponential backoff. Also a small REST client sharing the same
//! bounded retry executor.

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod reconnect;
pub mod rest;
pub mod retry;
pub mod router;
pub mod session;
pub mod task;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use adapter::{SessionStateListener, StateReportingAdapter};
pub use config::{load_settings, load_settings_from, LinkSettings};
pub use dispatcher::{ConnectionObserver, Dispatcher};
pub use error::LinkError;
pub use reconnect::{
    ConnectionPhase, ConnectionStateMachine, Connector, FixedJitter, JitterSource,
    RandomJitter, ReconnectListener, ReconnectPolicy,
};
pub use rest::RestClient;
pub use retry::{RetryError, RetryExecutor};
pub use router::{register, register_error, RouteKey, Subscription, TypedEventRouter};
pub use session::{LinkSession, SessionEvent, SessionSubscription};
pub use task::{Cancellable, Scheduler, TaskHandle, TokioScheduler};
pub use transport::{build_ws_url, ConnectionHandle, TransportConfig, TransportFactory};
