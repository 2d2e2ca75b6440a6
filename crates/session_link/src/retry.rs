use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, warn};

use crate::{
    error::LinkError,
    task::{Cancellable, TaskHandle},
};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_INTERVAL_MS: i64 = 500;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,
    #[error("failed after {attempts} attempt(s): {last}")]
    Failed { attempts: u32, last: E },
}

/// Retries a fallible async action a fixed number of times at a fixed
/// interval. Cancellation is sticky and shared by clones; each run gets its
/// own retry budget.
#[derive(Clone)]
pub struct RetryExecutor {
    shared: Arc<RetryShared>,
}

struct RetryShared {
    max_retries: u32,
    retry_interval: Duration,
    attempts_used: AtomicU32,
    cancelled: watch::Sender<bool>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_retries", &self.shared.max_retries)
            .field("retry_interval", &self.shared.retry_interval)
            .field("attempts_used", &self.attempts_used())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_MS)
    }
}

impl RetryExecutor {
    pub fn new(max_retries: u32, retry_interval_ms: i64) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            shared: Arc::new(RetryShared {
                max_retries,
                retry_interval: Duration::from_millis(retry_interval_ms.max(0) as u64),
                attempts_used: AtomicU32::new(0),
                cancelled,
            }),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.shared.max_retries
    }

    pub fn retry_interval(&self) -> Duration {
        self.shared.retry_interval
    }

    /// Retries consumed by the most recently updated run.
    pub fn attempts_used(&self) -> u32 {
        self.shared.attempts_used.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancelled.borrow()
    }

    pub fn cancel(&self) {
        if !self.shared.cancelled.send_replace(true) {
            debug!("retry: cancelled");
        }
    }

    /// Run `action` on the current tokio runtime, retrying on error.
    ///
    /// `on_success` gets the first successful value; `on_failure` gets the
    /// last error once every retry is spent. Neither fires after `cancel`.
    pub fn execute_with_retry<T, E, A, Fut, S, F>(
        &self,
        action: A,
        on_success: S,
        on_failure: F,
    ) -> Result<TaskHandle, LinkError>
    where
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        A: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| LinkError::NoRuntime)?;
        let executor = self.clone();
        Ok(TaskHandle::spawn(&runtime, async move {
            match executor.run(action).await {
                Ok(value) => on_success(value),
                Err(RetryError::Failed { last, .. }) => on_failure(last),
                Err(RetryError::Cancelled) => {}
            }
        }))
    }

    pub async fn run<T, E, A, Fut>(&self, action: A) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(action, |_| true).await
    }

    /// Like [`run`](Self::run), but errors for which `should_retry` returns
    /// false fail immediately.
    pub async fn run_if<T, E, A, Fut, P>(
        &self,
        mut action: A,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let shared = &self.shared;
        let mut cancelled = shared.cancelled.subscribe();
        // Each run owns its budget; the shared counter only reports it.
        let mut used = 0;
        shared.attempts_used.store(used, Ordering::SeqCst);

        loop {
            if *cancelled.borrow() {
                return Err(RetryError::Cancelled);
            }
            let outcome = action().await;
            // An attempt that was in flight during cancel may finish, but
            // its result is dropped.
            if *cancelled.borrow() {
                return Err(RetryError::Cancelled);
            }
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if used >= shared.max_retries || !should_retry(&err) {
                warn!(attempts = used + 1, error = %err, "retry: giving up");
                return Err(RetryError::Failed {
                    attempts: used + 1,
                    last: err,
                });
            }
            debug!(
                attempt = used + 1,
                interval_ms = shared.retry_interval.as_millis() as u64,
                error = %err,
                "retry: attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(shared.retry_interval) => {}
                _ = cancellation(&mut cancelled) => {
                    return Err(RetryError::Cancelled);
                }
            }
            used += 1;
            shared.attempts_used.store(used, Ordering::SeqCst);
        }
    }
}

async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    while !*cancelled.borrow_and_update() {
        if cancelled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Cancellable for RetryExecutor {
    fn cancel(&self) {
        RetryExecutor::cancel(self);
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
