//! Reconnect state machine.
//!
//! The machine observes transport lifecycle events and, after the
//! connection has opened at least once, answers abnormal terminations by
//! scheduling a call to the injected [`Connector`] with exponential backoff
//! and jitter. It never looks at the outcome of its own connect call: the
//! next lifecycle event of the new transport drives the next step.
//!
//! Phases:
//!
//! ```text
//! NeverConnected ──open──▶ Connected ──abnormal close──▶ ReconnectScheduled
//!                              │                            │      │
//!                              └──normal close──▶ Closed ◀──┘    open
//!                                                                  ▼
//!                                                              Connected
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use rand::Rng;
use shared::protocol::is_normal_closure;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::ConnectionObserver,
    error::LinkError,
    task::{Cancellable, Scheduler, TaskHandle, TokioScheduler},
};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_JITTER_MIN: Duration = Duration::from_millis(1_000);
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_millis(5_000);
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.3;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500_000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.max_delay.is_zero() {
            return Err(LinkError::Config("max reconnect delay must be > 0".into()));
        }
        if self.jitter_min > self.jitter_max {
            return Err(LinkError::Config(
                "jitter minimum must not exceed jitter maximum".into(),
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(LinkError::Config("growth factor must be >= 1.0".into()));
        }
        Ok(())
    }

    /// Delay of the first attempt in a cycle: base plus the cycle's jitter.
    pub fn first_delay(&self, jitter: Duration) -> Duration {
        self.base_delay.saturating_add(jitter).min(self.max_delay)
    }

    pub fn next_delay(&self, previous: Duration) -> Duration {
        let grown_ms = (previous.as_millis() as f64 * self.growth_factor).round();
        let max_ms = self.max_delay.as_millis() as f64;
        if grown_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(grown_ms as u64)
    }
}

/// Source of the per-cycle jitter component.
pub trait JitterSource: Send + Sync {
    fn draw(&self, min: Duration, max: Duration) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn draw(&self, min: Duration, max: Duration) -> Duration {
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        if min_ms >= max_ms {
            return min;
        }
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn draw(&self, min: Duration, max: Duration) -> Duration {
        self.0.clamp(min, max.max(min))
    }
}

/// Performs the actual reconnect: open a new transport and re-register
/// observers on it.
pub trait Connector: Send + Sync {
    fn connect(&self) -> anyhow::Result<Box<dyn Cancellable>>;
}

impl<F> Connector for F
where
    F: Fn() -> anyhow::Result<Box<dyn Cancellable>> + Send + Sync,
{
    fn connect(&self) -> anyhow::Result<Box<dyn Cancellable>> {
        self()
    }
}

pub trait ReconnectListener: Send + Sync {
    /// The transport failed before any connection ever opened. No reconnect
    /// is attempted.
    fn on_unexpected_disconnect(&self, _reason: &str) {}

    fn on_reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {}

    /// The attempt budget is spent; the owner has to intervene.
    fn on_reconnects_exhausted(&self, _attempts: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    NeverConnected,
    Connected,
    ReconnectScheduled,
    Closed,
}

#[derive(Debug)]
struct ReconnectState {
    phase: ConnectionPhase,
    has_connected_once: bool,
    attempt_count: u32,
    current_delay: Option<Duration>,
    pending_task: Option<TaskHandle>,
    shut_down: bool,
    // Bumped whenever the pending task is cleared or replaced, so a timer
    // that already fired can tell it went stale.
    generation: u64,
}

impl ReconnectState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::NeverConnected,
            has_connected_once: false,
            attempt_count: 0,
            current_delay: None,
            pending_task: None,
            shut_down: false,
            generation: 0,
        }
    }

    fn clear_pending(&mut self) {
        self.generation += 1;
        if let Some(task) = self.pending_task.take() {
            task.cancel();
        }
    }
}

#[derive(Default)]
struct ConnectGate {
    shut_down: bool,
    in_flight: Option<Box<dyn Cancellable>>,
}

enum Reaction {
    Ignore,
    UnexpectedDisconnect,
    Schedule {
        attempt: u32,
        delay: Duration,
        generation: u64,
    },
    Exhausted {
        attempts: u32,
    },
}

struct Inner {
    policy: ReconnectPolicy,
    jitter: Arc<dyn JitterSource>,
    scheduler: Arc<dyn Scheduler>,
    connector: Arc<dyn Connector>,
    listener: Option<Arc<dyn ReconnectListener>>,
    state: Mutex<ReconnectState>,
    gate: Mutex<ConnectGate>,
}

pub struct ReconnectBuilder {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    jitter: Arc<dyn JitterSource>,
    scheduler: Option<Arc<dyn Scheduler>>,
    listener: Option<Arc<dyn ReconnectListener>>,
}

impl ReconnectBuilder {
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ReconnectListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Without an explicit scheduler this captures the current tokio runtime.
    pub fn build(self) -> Result<ConnectionStateMachine, LinkError> {
        self.policy.validate()?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        Ok(ConnectionStateMachine {
            inner: Arc::new(Inner {
                policy: self.policy,
                jitter: self.jitter,
                scheduler,
                connector: self.connector,
                listener: self.listener,
                state: Mutex::new(ReconnectState::new()),
                gate: Mutex::new(ConnectGate::default()),
            }),
        })
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl ConnectionStateMachine {
    pub fn builder(connector: Arc<dyn Connector>) -> ReconnectBuilder {
        ReconnectBuilder {
            connector,
            policy: ReconnectPolicy::default(),
            jitter: Arc::new(RandomJitter),
            scheduler: None,
            listener: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state().phase
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.state().attempt_count
    }

    pub fn current_delay(&self) -> Option<Duration> {
        self.inner.state().current_delay
    }

    pub fn has_connected_once(&self) -> bool {
        self.inner.state().has_connected_once
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.state().pending_task.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state().shut_down
    }

    /// Stop for good: cancel any scheduled reconnect and the handle of the
    /// last connect call, and ignore every later lifecycle event. Once this
    /// returns the connector is never invoked again.
    pub fn shutdown(&self) {
        let in_flight = {
            let mut gate = self.inner.gate();
            if gate.shut_down {
                return;
            }
            gate.shut_down = true;
            gate.in_flight.take()
        };
        let pending = {
            let mut state = self.inner.state();
            state.shut_down = true;
            state.phase = ConnectionPhase::Closed;
            state.generation += 1;
            state.pending_task.take()
        };
        if let Some(task) = pending {
            task.cancel();
        }
        if let Some(handle) = in_flight {
            handle.cancel();
        }
        info!("link: reconnect machine shut down");
    }

    fn react(&self, reaction: Reaction) {
        match reaction {
            Reaction::Ignore => {}
            Reaction::UnexpectedDisconnect => {
                if let Some(listener) = &self.inner.listener {
                    listener.on_unexpected_disconnect("transport failed before first open");
                }
            }
            Reaction::Schedule {
                attempt,
                delay,
                generation,
            } => self.schedule(attempt, delay, generation),
            Reaction::Exhausted { attempts } => {
                warn!(attempts, "link: reconnect attempts exhausted");
                if let Some(listener) = &self.inner.listener {
                    listener.on_reconnects_exhausted(attempts);
                }
            }
        }
    }

    fn schedule(&self, attempt: u32, delay: Duration, generation: u64) {
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "link: reconnect scheduled"
        );
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(generation, attempt);
                }
            }),
        );
        let stale = {
            let mut state = self.inner.state();
            if state.generation == generation && !state.shut_down {
                state.pending_task = Some(task.clone());
                false
            } else {
                true
            }
        };
        if stale {
            task.cancel();
            return;
        }
        if let Some(listener) = &self.inner.listener {
            listener.on_reconnect_scheduled(attempt, delay);
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ReconnectState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, ConnectGate> {
        self.gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn plan_reconnect(&self, state: &mut ReconnectState) -> Reaction {
        if state.attempt_count >= self.policy.max_attempts {
            let already_closed = state.phase == ConnectionPhase::Closed;
            state.phase = ConnectionPhase::Closed;
            if already_closed {
                return Reaction::Ignore;
            }
            return Reaction::Exhausted {
                attempts: state.attempt_count,
            };
        }
        let delay = match state.current_delay {
            Some(previous) => self.policy.next_delay(previous),
            None => {
                let jitter = self
                    .jitter
                    .draw(self.policy.jitter_min, self.policy.jitter_max);
                self.policy.first_delay(jitter)
            }
        };
        state.current_delay = Some(delay);
        state.attempt_count += 1;
        state.phase = ConnectionPhase::ReconnectScheduled;
        state.generation += 1;
        Reaction::Schedule {
            attempt: state.attempt_count,
            delay,
            generation: state.generation,
        }
    }

    /// Timer callback. Holds the gate for the whole connector call so that
    /// `shutdown` either runs before (and we bail) or waits for us.
    fn fire(&self, generation: u64, attempt: u32) {
        let mut gate = self.gate();
        if gate.shut_down {
            return;
        }
        {
            let state = self.state();
            if state.shut_down || state.generation != generation {
                debug!(attempt, "link: stale reconnect timer ignored");
                return;
            }
        }
        match self.connector.connect() {
            Ok(handle) => {
                debug!(attempt, "link: reconnect attempt started");
                gate.in_flight = Some(handle);
            }
            // Still counts as a used attempt; the next lifecycle event
            // decides what happens next.
            Err(err) => warn!(attempt, error = %err, "link: reconnect attempt failed"),
        }
    }
}

impl ConnectionObserver for ConnectionStateMachine {
    fn on_open(&self) {
        {
            let mut state = self.inner.state();
            if state.shut_down {
                return;
            }
            state.clear_pending();
            state.phase = ConnectionPhase::Connected;
            state.has_connected_once = true;
            state.attempt_count = 0;
            state.current_delay = None;
        }
        info!("link: connected");
    }

    fn on_failure(&self, reason: &str) {
        let reaction = {
            let mut state = self.inner.state();
            if state.shut_down {
                return;
            }
            state.clear_pending();
            if state.has_connected_once {
                self.inner.plan_reconnect(&mut state)
            } else {
                Reaction::UnexpectedDisconnect
            }
        };
        warn!(reason, "link: transport failure");
        self.react(reaction);
    }

    fn on_closing(&self, code: u16, reason: &str) {
        let reaction = {
            let mut state = self.inner.state();
            if state.shut_down {
                return;
            }
            state.clear_pending();
            if is_normal_closure(code) {
                if state.has_connected_once {
                    state.phase = ConnectionPhase::Closed;
                }
                Reaction::Ignore
            } else if state.has_connected_once {
                self.inner.plan_reconnect(&mut state)
            } else {
                Reaction::Ignore
            }
        };
        info!(code, reason, "link: peer closing connection");
        self.react(reaction);
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
