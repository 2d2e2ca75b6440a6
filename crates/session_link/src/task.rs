use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};

use crate::error::LinkError;

pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

impl<T: Cancellable + ?Sized> Cancellable for Arc<T> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

impl<T: Cancellable + ?Sized> Cancellable for Box<T> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

#[derive(Clone, Default)]
pub struct TaskHandle {
    inner: Arc<TaskHandleInner>,
}

#[derive(Default)]
struct TaskHandleInner {
    cancelled: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn noop() -> Self {
        Self::new()
    }

    pub fn spawn<F>(runtime: &Handle, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = Self::new();
        handle.attach(runtime.spawn(future));
        handle
    }

    /// Bind a spawned task to this handle. A handle cancelled before the
    /// task was attached aborts it immediately.
    pub fn attach(&self, join: JoinHandle<()>) {
        if self.is_cancelled() {
            join.abort();
            return;
        }
        let mut slot = self
            .inner
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(join) {
            previous.abort();
        }
        // cancel() may have run between the check above and taking the lock.
        if self.is_cancelled() {
            if let Some(join) = slot.take() {
                join.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True once the attached task completed or was aborted. A handle with
    /// no task counts as finished.
    pub fn is_finished(&self) -> bool {
        self.inner
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Cancellable for TaskHandle {
    fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let join = self
            .inner
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(join) = join {
            join.abort();
        }
    }
}

/// Runs a task once after a delay, unless cancelled first.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle;
}

#[derive(Clone, Debug)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn current() -> Result<Self, LinkError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| LinkError::NoRuntime)
    }

    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        let handle = TaskHandle::new();
        let observed = handle.clone();
        handle.attach(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if observed.is_cancelled() {
                return;
            }
            task();
        }));
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn scheduled_task_runs_after_delay() {
        let scheduler = TokioScheduler::current().expect("runtime");
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _handle = scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("task fired")
            .expect("sender kept");
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let scheduler = TokioScheduler::current().expect("runtime");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn scheduler_requires_a_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(LinkError::NoRuntime)
        ));
    }

    #[test]
    fn noop_handle_is_finished() {
        let handle = TaskHandle::noop();
        assert!(handle.is_finished());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
