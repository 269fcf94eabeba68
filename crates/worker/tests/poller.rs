//! Poller loop: state transitions, backoff timing and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use imagex_cloud::memory::MemoryQueue;
use imagex_cloud::queue::{JobQueue, QueueError};
use imagex_core::status::{JobCounter, StatusRegistry, WorkerState};
use imagex_worker::dispatcher::Dispatcher;
use imagex_worker::poller::{PollSettings, Poller, PollerExit};

use common::{
    dispatch_settings, job_body, no_jitter_policy, wait_for_state, wait_until, FakeEngine,
    RecordingQueue,
};

const POLL: PollSettings = PollSettings {
    max_messages: 1,
    wait_secs: 1,
};

fn poller(queue: Arc<dyn JobQueue>, engine: Arc<FakeEngine>, status: &Arc<StatusRegistry>) -> Poller {
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        engine,
        Arc::clone(status),
        dispatch_settings(),
    );
    Poller::new(
        queue,
        dispatcher,
        Arc::clone(status),
        POLL,
        no_jitter_policy(100, 10_000),
    )
}

/// Cancel `token` once `condition` holds.
fn cancel_when(token: &CancellationToken, condition: impl Fn() -> bool + Send + 'static) {
    let token = token.clone();
    tokio::spawn(async move {
        wait_until("cancel condition", condition).await;
        token.cancel();
    });
}

// ---------------------------------------------------------------------------
// Test: an idle queue keeps the worker in Polling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_polls_stay_in_polling() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    let engine = Arc::new(FakeEngine::new());
    let mut poller = poller(queue.clone(), engine.clone(), &status);

    let cancel = CancellationToken::new();
    let watched = queue.clone();
    let observer = Arc::clone(&status);
    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    cancel_when(&cancel, move || {
        seen.lock().unwrap().push(observer.state());
        watched.receive_calls() >= 6
    });

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);

    assert!(queue.receive_calls() >= 5);
    assert_eq!(engine.calls(), 0);
    assert_eq!(status.state(), WorkerState::Polling);
    let states = states.lock().unwrap();
    assert!(states
        .iter()
        .skip_while(|s| **s != WorkerState::Polling)
        .all(|s| *s == WorkerState::Polling));
}

// ---------------------------------------------------------------------------
// Test: transient receive errors back off exponentially, then recover
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_errors_back_off_then_reset() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(RecordingQueue::new(Arc::clone(&status)));
    for _ in 0..3 {
        queue
            .inner
            .push_receive_error(QueueError::Transient("connection reset".into()));
    }
    let engine = Arc::new(FakeEngine::new());
    let mut poller = poller(queue.clone(), engine, &status);

    let cancel = CancellationToken::new();
    let watched = queue.clone();
    cancel_when(&cancel, move || watched.receives().len() >= 5);

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);

    let receives = queue.receives();
    let gaps: Vec<Duration> = receives.windows(2).map(|w| w[1].0 - w[0].0).collect();
    for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected about {expected:?}",
        );
    }

    let states: Vec<WorkerState> = receives.iter().map(|(_, s)| *s).collect();
    assert_eq!(states[1], WorkerState::Backoff);
    assert_eq!(states[3], WorkerState::Backoff);
    assert_eq!(states[4], WorkerState::Polling);

    assert_eq!(poller.backoff_streak(), 0);
    assert_eq!(status.state(), WorkerState::Polling);
    assert!(status.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn receives_request_the_worker_visibility_timeout() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(RecordingQueue::new(Arc::clone(&status)));
    queue.inner.send(job_body("job-1"));
    let mut poller = poller(queue.clone(), Arc::new(FakeEngine::new()), &status);

    let cancel = CancellationToken::new();
    let watched = queue.clone();
    cancel_when(&cancel, move || watched.receives().len() >= 3);

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);
    let requests = queue.visibility_requests();
    assert!(requests.len() >= 3);
    assert!(requests
        .iter()
        .all(|v| *v == Some(dispatch_settings().visibility_timeout_secs)));
}

#[tokio::test(start_paused = true)]
async fn backoff_records_last_error() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    queue.push_receive_error(QueueError::Transient("ThrottlingException".into()));
    let mut poller = poller(queue.clone(), Arc::new(FakeEngine::new()), &status);

    let cancel = CancellationToken::new();
    let observer = Arc::clone(&status);
    cancel_when(&cancel, move || observer.state() == WorkerState::Backoff);

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);
    assert_eq!(status.state(), WorkerState::Backoff);
    assert!(status
        .last_error()
        .is_some_and(|e| e.contains("ThrottlingException")));
    assert_eq!(poller.backoff_streak(), 1);
}

// ---------------------------------------------------------------------------
// Test: permanent queue errors halt the loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn permanent_error_enters_config_error() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    queue.push_receive_error(QueueError::Permanent("AWS.SimpleQueueService.NonExistentQueue".into()));
    let mut poller = poller(queue.clone(), Arc::new(FakeEngine::new()), &status);

    assert_eq!(poller.run(CancellationToken::new()).await, PollerExit::ConfigError);

    assert_eq!(status.state(), WorkerState::ConfigError);
    assert!(status.last_error().is_some_and(|e| e.contains("NonExistentQueue")));
    assert_eq!(queue.receive_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn config_error_state_stops_the_loop_before_receiving() {
    let status = Arc::new(StatusRegistry::new());
    status.set_state(WorkerState::ConfigError);
    let queue = Arc::new(MemoryQueue::new());
    let mut poller = poller(queue.clone(), Arc::new(FakeEngine::new()), &status);

    assert_eq!(poller.run(CancellationToken::new()).await, PollerExit::ConfigError);
    assert_eq!(queue.receive_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn successful_receive_does_not_overwrite_stopping() {
    let status = Arc::new(StatusRegistry::new());
    status.set_state(WorkerState::Stopping);
    let queue = Arc::new(MemoryQueue::new());
    let mut poller = poller(queue.clone(), Arc::new(FakeEngine::new()), &status);

    let cancel = CancellationToken::new();
    let watched = queue.clone();
    cancel_when(&cancel, move || watched.receive_calls() >= 3);

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);
    assert!(queue.receive_calls() >= 2);
    assert_eq!(status.state(), WorkerState::Stopping);
}

// ---------------------------------------------------------------------------
// Test: cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_long_poll() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    let mut poller = Poller::new(
        queue.clone(),
        Dispatcher::new(
            queue.clone(),
            Arc::new(FakeEngine::new()),
            Arc::clone(&status),
            dispatch_settings(),
        ),
        Arc::clone(&status),
        PollSettings {
            max_messages: 1,
            wait_secs: 20,
        },
        no_jitter_policy(100, 1_000),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { poller.run(cancel).await }
    });

    wait_until("first receive", || queue.receive_calls() == 1).await;
    let started = tokio::time::Instant::now();
    cancel.cancel();
    let exit = task.await.unwrap();

    assert_eq!(exit, PollerExit::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_backoff_sleep() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    queue.push_receive_error(QueueError::Transient("blip".into()));
    let dispatcher = Dispatcher::new(
        queue.clone(),
        Arc::new(FakeEngine::new()),
        Arc::clone(&status),
        dispatch_settings(),
    );
    let mut poller = Poller::new(
        queue.clone(),
        dispatcher,
        Arc::clone(&status),
        POLL,
        no_jitter_policy(60_000, 60_000),
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { poller.run(cancel).await }
    });

    wait_for_state(&status, WorkerState::Backoff).await;
    let started = tokio::time::Instant::now();
    cancel.cancel();

    assert_eq!(task.await.unwrap(), PollerExit::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(queue.receive_calls(), 1);
}

// ---------------------------------------------------------------------------
// Test: batches are dispatched in order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_is_dispatched_in_receive_order() {
    let status = Arc::new(StatusRegistry::new());
    let queue = Arc::new(MemoryQueue::new());
    for job in ["a", "b", "c"] {
        queue.send(job_body(job));
    }
    let engine = Arc::new(FakeEngine::new());
    let dispatcher = Dispatcher::new(
        queue.clone(),
        engine.clone(),
        Arc::clone(&status),
        dispatch_settings(),
    );
    let mut poller = Poller::new(
        queue.clone(),
        dispatcher,
        Arc::clone(&status),
        PollSettings {
            max_messages: 10,
            wait_secs: 1,
        },
        no_jitter_policy(100, 1_000),
    );

    let cancel = CancellationToken::new();
    let watched = queue.clone();
    cancel_when(&cancel, move || watched.is_empty());

    assert_eq!(poller.run(cancel).await, PollerExit::Cancelled);
    assert_eq!(engine.jobs(), vec!["a", "b", "c"]);
    assert_eq!(status.count(JobCounter::Succeeded), 3);
}
