mod common;

use common::test_helpers::LogCapture;
use courier::{
    CircuitState, Jitter, ManualClock, RetryConfig, RetryScheduler, TaskContext, TaskHandle,
    TaskOutcome,
};
use futures::future::{ready, Ready};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn scheduler(config: RetryConfig, clock: &ManualClock) -> RetryScheduler {
    RetryScheduler::new(config).expect("valid config").with_clock(clock.clone())
}

/// Operation that fails `failures` times, then succeeds.
fn flaky(
    failures: usize,
    calls: Rc<Cell<usize>>,
) -> impl FnMut() -> Ready<Result<&'static str, String>> {
    move || {
        let n = calls.get() + 1;
        calls.set(n);
        ready(if n > failures { Ok("delivered") } else { Err(format!("attempt {n} failed")) })
    }
}

#[derive(Default)]
struct Outcomes {
    successes: Cell<usize>,
    failures: Cell<usize>,
    last_error: RefCell<Option<String>>,
}

fn submit(
    s: &RetryScheduler,
    failures: usize,
    calls: &Rc<Cell<usize>>,
    outcomes: &Rc<Outcomes>,
) -> TaskHandle {
    let ok = outcomes.clone();
    let failed = outcomes.clone();
    s.execute_with_retry(
        flaky(failures, calls.clone()),
        TaskContext::new("test"),
        move |_| ok.successes.set(ok.successes.get() + 1),
        move |err| {
            failed.failures.set(failed.failures.get() + 1);
            *failed.last_error.borrow_mut() = Some(err);
        },
    )
}

#[test]
fn consecutive_failures_open_breaker_until_reset_timeout() {
    let logs = LogCapture::start();
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            ..RetryConfig::default()
        },
        &clock,
    );

    s.record_failure();
    s.record_failure();
    assert!(s.can_attempt(), "below threshold");
    s.record_failure();
    assert_eq!(s.breaker().state(), CircuitState::Open);
    assert!(!s.can_attempt());

    clock.advance(59_999);
    assert!(!s.can_attempt());
    clock.advance(1);
    assert!(s.can_attempt());
    assert_eq!(s.breaker().state(), CircuitState::HalfOpen);

    let logs = logs.contents();
    assert!(logs.contains("Circuit breaker → open"), "logs: {logs}");
    assert!(logs.contains("Circuit breaker → half-open"), "logs: {logs}");
}

#[test]
fn half_open_admits_exactly_one_probe() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            ..RetryConfig::default()
        },
        &clock,
    );
    s.record_failure();
    clock.advance(10_000);

    assert!(s.can_attempt());
    assert!(!s.can_attempt());
    assert!(!s.can_attempt());

    // Failed probe reopens and restarts the timeout.
    s.record_failure();
    assert_eq!(s.breaker().state(), CircuitState::Open);
    assert!(!s.can_attempt());

    clock.advance(10_000);
    assert!(s.can_attempt());
    s.record_success();
    let status = s.status();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.consecutive_failures, 0);
    assert!(s.can_attempt());
}

#[test]
fn success_on_third_attempt_waits_sum_of_prior_delays() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 4,
            retry_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        },
        &clock,
    );
    let calls = Rc::new(Cell::new(0));
    let outcomes = Rc::new(Outcomes::default());
    let handle = submit(&s, 2, &calls, &outcomes);

    for _ in 0..20 {
        s.update(Duration::from_millis(50));
    }

    assert_eq!(handle.outcome(), TaskOutcome::Succeeded);
    assert_eq!(calls.get(), 3);
    assert_eq!(handle.attempts(), 3);
    assert_eq!(outcomes.successes.get(), 1);
    assert_eq!(outcomes.failures.get(), 0);
    assert_eq!(handle.total_wait(), s.delays().total_before(3));
    assert_eq!(handle.total_wait(), Duration::from_millis(300));
}

#[test]
fn always_failing_operation_fails_once_and_counts_once() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        },
        &clock,
    );
    let calls = Rc::new(Cell::new(0));
    let outcomes = Rc::new(Outcomes::default());
    let handle = submit(&s, usize::MAX, &calls, &outcomes);

    for _ in 0..10 {
        s.update(Duration::from_millis(100));
    }

    assert_eq!(handle.outcome(), TaskOutcome::Failed);
    assert_eq!(calls.get(), 3);
    assert_eq!(outcomes.failures.get(), 1);
    assert_eq!(outcomes.successes.get(), 0);
    assert_eq!(outcomes.last_error.borrow().as_deref(), Some("attempt 3 failed"));
    assert_eq!(s.status().failure_count, 1);
    assert_eq!(s.status().consecutive_failures, 1);
    assert_eq!(s.active_tasks(), 0);
}

#[test]
fn three_exhausted_tasks_open_the_breaker() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            ..RetryConfig::default()
        },
        &clock,
    );
    let outcomes = Rc::new(Outcomes::default());
    for _ in 0..3 {
        submit(&s, usize::MAX, &Rc::new(Cell::new(0)), &outcomes);
    }
    s.update(Duration::ZERO);
    assert!(s.can_attempt(), "tasks are still waiting to retry");
    s.update(Duration::from_millis(10));

    assert_eq!(outcomes.failures.get(), 3);
    assert!(s.status().is_open);
    assert!(!s.can_attempt());
}

#[test]
fn fails_twice_then_succeeds_with_one_second_base_delay() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            ..RetryConfig::default()
        },
        &clock,
    );
    s.record_failure();
    assert_eq!(s.status().consecutive_failures, 1);

    let calls = Rc::new(Cell::new(0));
    let outcomes = Rc::new(Outcomes::default());
    let handle = submit(&s, 2, &calls, &outcomes);

    s.update(Duration::ZERO);
    assert_eq!(calls.get(), 1);
    s.update(Duration::from_secs(1));
    assert_eq!(calls.get(), 2);
    s.update(Duration::from_secs(2));
    assert_eq!(calls.get(), 3);

    assert_eq!(outcomes.successes.get(), 1);
    assert_eq!(outcomes.failures.get(), 0);
    assert_eq!(handle.total_wait(), Duration::from_secs(3));
    assert_eq!(s.status().consecutive_failures, 0);
}

#[test]
fn tasks_progress_independently() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        },
        &clock,
    );
    let outcomes = Rc::new(Outcomes::default());
    let slow = submit(&s, 1, &Rc::new(Cell::new(0)), &outcomes);
    let fast = submit(&s, 0, &Rc::new(Cell::new(0)), &outcomes);

    s.update(Duration::ZERO);
    assert!(fast.is_finished());
    assert!(!slow.is_finished());
    assert_eq!(s.active_tasks(), 1);

    s.update(Duration::from_millis(100));
    assert!(slow.is_finished());
    assert_eq!(outcomes.successes.get(), 2);
}

#[test]
fn capped_and_jittered_delays_stay_within_bounds() {
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 4,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Some(Duration::from_millis(1500)),
            jitter: Jitter::Full,
            ..RetryConfig::default()
        },
        &clock,
    );
    assert_eq!(s.delays().get(2), Duration::from_millis(1500));
    assert_eq!(s.delays().get(3), Duration::from_millis(1500));

    let calls = Rc::new(Cell::new(0));
    let outcomes = Rc::new(Outcomes::default());
    let handle = submit(&s, 1, &calls, &outcomes);
    s.update(Duration::ZERO);
    s.update(Duration::from_secs(1));

    assert_eq!(handle.outcome(), TaskOutcome::Succeeded);
    assert!(handle.total_wait() <= Duration::from_secs(1));
}

#[test]
fn retry_attempts_are_logged_with_context() {
    let logs = LogCapture::start();
    let clock = ManualClock::new();
    let s = scheduler(
        RetryConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        &clock,
    );
    s.execute_with_retry(
        || ready(Err::<(), _>("HTTP 503")),
        TaskContext::new("send_event").with("event_id", "evt-1"),
        |_| {},
        |_| {},
    );
    s.update(Duration::ZERO);
    s.update(Duration::from_millis(5));

    let logs = logs.contents();
    assert!(logs.contains("attempt failed; retrying after backoff"), "logs: {logs}");
    assert!(logs.contains("retries exhausted"), "logs: {logs}");
    assert!(logs.contains("event_id=evt-1"), "logs: {logs}");
}
