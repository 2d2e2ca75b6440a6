use super::*;
use std::sync::atomic::AtomicUsize;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
enum Outcome {
    Success(u32),
    Failure(String),
}

fn outcome_channel() -> (
    impl FnOnce(u32) + Send + 'static,
    impl FnOnce(String) + Send + 'static,
    mpsc::UnboundedReceiver<Outcome>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let success_tx = tx.clone();
    (
        move |value| {
            let _ = success_tx.send(Outcome::Success(value));
        },
        move |err| {
            let _ = tx.send(Outcome::Failure(err));
        },
        rx,
    )
}

/// Fails the first `failures` calls, then returns the call number.
fn flaky_action(
    calls: Arc<AtomicUsize>,
    failures: usize,
) -> impl FnMut() -> futures::future::Ready<Result<u32, String>> + Send + 'static {
    move || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        futures::future::ready(if call <= failures {
            Err(format!("failure #{call}"))
        } else {
            Ok(call as u32)
        })
    }
}

async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("outcome in time")
        .expect("channel open")
}

#[tokio::test]
async fn always_failing_action_runs_max_retries_plus_one_times() {
    let executor = RetryExecutor::new(2, 10);
    let calls = Arc::new(AtomicUsize::new(0));
    let (on_success, on_failure, mut rx) = outcome_channel();

    executor
        .execute_with_retry(flaky_action(calls.clone(), usize::MAX), on_success, on_failure)
        .expect("runtime");

    assert_eq!(next_outcome(&mut rx).await, Outcome::Failure("failure #3".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(rx.try_recv().is_err());
    assert_eq!(executor.attempts_used(), 2);
}

#[tokio::test]
async fn cancel_before_execute_prevents_any_invocation() {
    let executor = RetryExecutor::new(2, 10);
    let calls = Arc::new(AtomicUsize::new(0));
    let (on_success, on_failure, mut rx) = outcome_channel();

    executor.cancel();
    let handle = executor
        .execute_with_retry(flaky_action(calls.clone(), 0), on_success, on_failure)
        .expect("runtime");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err());
    assert!(handle.is_finished());
}

#[tokio::test]
async fn one_failure_then_success_reports_success_once() {
    let executor = RetryExecutor::new(2, 10);
    let calls = Arc::new(AtomicUsize::new(0));
    let (on_success, on_failure, mut rx) = outcome_channel();

    executor
        .execute_with_retry(flaky_action(calls.clone(), 1), on_success, on_failure)
        .expect("runtime");

    assert_eq!(next_outcome(&mut rx).await, Outcome::Success(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_during_wait_suppresses_pending_retry_and_callbacks() {
    let executor = RetryExecutor::new(3, 200);
    let calls = Arc::new(AtomicUsize::new(0));
    let (on_success, on_failure, mut rx) = outcome_channel();

    executor
        .execute_with_retry(flaky_action(calls.clone(), usize::MAX), on_success, on_failure)
        .expect("runtime");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    executor.cancel();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_err());
    assert!(executor.is_cancelled());
}

#[tokio::test]
async fn in_flight_attempt_finishes_but_its_result_is_dropped() {
    let executor = RetryExecutor::new(2, 10);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
    let (on_success, on_failure, mut rx) = outcome_channel();

    executor
        .execute_with_retry(
            move || {
                let release_rx = Arc::clone(&release_rx);
                async move {
                    if let Some(release) = release_rx.lock().await.take() {
                        let _ = release.await;
                    }
                    Ok::<u32, String>(7)
                }
            },
            on_success,
            on_failure,
        )
        .expect("runtime");

    tokio::time::sleep(Duration::from_millis(20)).await;
    executor.cancel();
    let _ = release_tx.send(());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn run_reports_last_error_only() {
    let executor = RetryExecutor::new(1, 0);
    let calls = Arc::new(AtomicUsize::new(0));

    let result = executor.run(flaky_action(calls.clone(), usize::MAX)).await;

    match result {
        Err(RetryError::Failed { attempts, last }) => {
            assert_eq!(attempts, 2);
            assert_eq!(last, "failure #2");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_runs_each_get_the_full_budget() {
    let executor = RetryExecutor::new(2, 20);
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let first = executor.clone();
    let second = executor.clone();
    let (first, second) = tokio::join!(
        first.run(flaky_action(first_calls.clone(), usize::MAX)),
        second.run(flaky_action(second_calls.clone(), usize::MAX)),
    );

    assert!(matches!(first, Err(RetryError::Failed { attempts: 3, .. })));
    assert!(matches!(second, Err(RetryError::Failed { attempts: 3, .. })));
    assert_eq!(first_calls.load(Ordering::SeqCst), 3);
    assert_eq!(second_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn run_if_stops_on_non_retryable_error() {
    let executor = RetryExecutor::new(5, 0);
    let calls = Arc::new(AtomicUsize::new(0));

    let result = executor
        .run_if(flaky_action(calls.clone(), usize::MAX), |err: &String| {
            !err.ends_with("#1")
        })
        .await;

    assert!(matches!(result, Err(RetryError::Failed { attempts: 1, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn negative_interval_is_clamped_to_zero() {
    let executor = RetryExecutor::new(0, -250);
    assert_eq!(executor.retry_interval(), Duration::ZERO);
    assert_eq!(executor.max_retries(), 0);
}

#[test]
fn execute_outside_runtime_is_rejected() {
    let executor = RetryExecutor::default();
    let result = executor.execute_with_retry(
        || futures::future::ready(Ok::<u32, String>(1)),
        |_| {},
        |_: String| {},
    );
    assert!(matches!(result, Err(LinkError::NoRuntime)));
}
