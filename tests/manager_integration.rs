use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use genpool::warmup::{WarmupSettings, WARMUP_INITIAL_DELAY};
use genpool::{CircuitState, ConfigError, Manager, ManagerConfig, ManagerError, Upstream, UpstreamError};

/// How a scripted call ends
#[derive(Clone, Copy)]
enum Outcome {
    Ok,
    Status(u16),
    Transport,
}

/// A request for the scripted upstream
struct Job {
    id: u32,
    outcome: Outcome,
    gate: Option<Arc<Notify>>,
}

impl Job {
    fn ok(id: u32) -> Self {
        Self { id, outcome: Outcome::Ok, gate: None }
    }

    fn failing(id: u32) -> Self {
        Self { id, outcome: Outcome::Status(500), gate: None }
    }

    fn broken_pipe(id: u32) -> Self {
        Self { id, outcome: Outcome::Transport, gate: None }
    }

    /// Succeeds once `gate` is notified
    fn gated(id: u32, gate: &Arc<Notify>) -> Self {
        Self { id, outcome: Outcome::Ok, gate: Some(Arc::clone(gate)) }
    }
}

#[derive(Default)]
struct Script {
    connects: AtomicUsize,
    calls: AtomicUsize,
    pings: AtomicUsize,
    in_call: AtomicUsize,
    max_in_call: AtomicUsize,
    fail_connects: AtomicBool,
    fail_pings: AtomicBool,
    hang_pings: AtomicBool,
}

/// Upstream whose counters stay readable after the manager takes ownership
#[derive(Clone, Default)]
struct ScriptedUpstream(Arc<Script>);

impl Deref for ScriptedUpstream {
    type Target = Script;

    fn deref(&self) -> &Script {
        &self.0
    }
}

impl Upstream for ScriptedUpstream {
    type Handle = usize;
    type Payload = Job;
    type Output = u32;

    async fn connect(&self) -> Result<usize, UpstreamError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".into()));
        }
        Ok(self.connects.fetch_add(1, Ordering::SeqCst))
    }

    async fn call(&self, _handle: &mut usize, job: Job) -> Result<u32, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_call.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_call.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &job.gate {
            gate.notified().await;
        }
        self.in_call.fetch_sub(1, Ordering::SeqCst);

        match job.outcome {
            Outcome::Ok => Ok(job.id),
            Outcome::Status(status) => Err(UpstreamError::Status {
                status,
                body: "scripted failure".into(),
            }),
            Outcome::Transport => Err(UpstreamError::Transport("broken pipe".into())),
        }
    }

    async fn ping(&self, _handle: &mut usize) -> Result<(), UpstreamError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.hang_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_pings.load(Ordering::SeqCst) {
            Err(UpstreamError::Status { status: 503, body: "loading".into() })
        } else {
            Ok(())
        }
    }
}

fn config(max_connections: usize, max_queue_size: usize) -> ManagerConfig {
    ManagerConfig {
        max_connections,
        max_pool_size: max_connections,
        max_queue_size,
        ..ManagerConfig::default()
    }
}

/// Manager whose background warmup stays out of the way of the test
fn manager(config: ManagerConfig) -> (Arc<Manager<ScriptedUpstream>>, ScriptedUpstream) {
    let upstream = ScriptedUpstream::default();
    let settings = WarmupSettings {
        initial_delay: Duration::from_secs(3600),
        ..WarmupSettings::from(&config)
    };
    let manager = Manager::with_warmup(config, upstream.clone(), settings).unwrap();
    (Arc::new(manager), upstream)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_two_run_one_queues_one_rejected() {
    let (manager, upstream) = manager(config(2, 1));
    let gate1 = Arc::new(Notify::new());
    let gate2 = Arc::new(Notify::new());

    let m = Arc::clone(&manager);
    let job = Job::gated(1, &gate1);
    let r1 = tokio::spawn(async move { m.submit(job).await });
    let m = Arc::clone(&manager);
    let job = Job::gated(2, &gate2);
    let r2 = tokio::spawn(async move { m.submit(job).await });
    eventually("two calls in flight", || upstream.in_call.load(Ordering::SeqCst) == 2).await;

    let m = Arc::clone(&manager);
    let r3 = tokio::spawn(async move { m.submit(Job::ok(3)).await });
    eventually("third request queued", || manager.stats().queue_length == 1).await;

    let r4 = manager.submit(Job::ok(4)).await;
    assert!(matches!(r4, Err(ManagerError::QueueFull { capacity: 1 })));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);

    gate1.notify_one();
    assert_eq!(r1.await.unwrap().unwrap(), 1);
    assert_eq!(r3.await.unwrap().unwrap(), 3);

    gate2.notify_one();
    assert_eq!(r2.await.unwrap().unwrap(), 2);

    let stats = manager.stats();
    assert_eq!(upstream.max_in_call.load(Ordering::SeqCst), 2);
    assert_eq!(stats.pool.total_created, 2);
    assert_eq!(stats.pool.total_reused, 1);
    assert_eq!(stats.admission.total_queued, 1);
    assert_eq!(stats.admission.total_queue_full, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_active_connections_never_exceed_limit() {
    let (manager, upstream) = manager(config(3, 64));

    let mut tasks = Vec::new();
    for id in 0..40 {
        let m = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let result = m.submit(Job::ok(id)).await;
            assert!(m.stats().active_connections <= 3);
            result
        }));
    }

    for (id, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), id as u32);
    }

    assert!(upstream.max_in_call.load(Ordering::SeqCst) <= 3);
    assert!(upstream.connects.load(Ordering::SeqCst) <= 3);
    assert_eq!(manager.stats().pooled_idle, manager.stats().active_connections);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_admits_trial_after_reset() {
    let (manager, upstream) = manager(ManagerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 1000,
        ..config(2, 4)
    });

    for id in 0..3 {
        let err = manager.submit(Job::failing(id)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Upstream(UpstreamError::Status { status: 500, .. })));
    }
    assert_eq!(manager.stats().breaker_state, CircuitState::Open);

    tokio::time::advance(Duration::from_millis(500)).await;
    let err = manager.submit(Job::ok(10)).await.unwrap_err();
    match err {
        ManagerError::CircuitOpen { retry_in } => assert_eq!(retry_in, Duration::from_millis(500)),
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(manager.submit(Job::ok(11)).await.unwrap(), 11);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 4);
    assert_eq!(manager.stats().breaker_state, CircuitState::HalfOpen);

    // Default half_open_max_trials is 3
    manager.submit(Job::ok(12)).await.unwrap();
    manager.submit(Job::ok(13)).await.unwrap();
    let stats = manager.stats();
    assert_eq!(stats.breaker_state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.breaker.open_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_breaker() {
    let (manager, upstream) = manager(ManagerConfig {
        failure_threshold: 2,
        reset_timeout_ms: 1000,
        ..config(2, 4)
    });

    manager.submit(Job::failing(1)).await.unwrap_err();
    manager.submit(Job::failing(2)).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1000)).await;

    manager.submit(Job::failing(3)).await.unwrap_err();
    assert_eq!(manager.stats().breaker_state, CircuitState::Open);

    let err = manager.submit(Job::ok(4)).await.unwrap_err();
    assert!(err.is_admission_rejection());
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.stats().breaker.open_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_caps_concurrent_trials() {
    let (manager, upstream) = manager(ManagerConfig {
        failure_threshold: 1,
        reset_timeout_ms: 1000,
        half_open_max_trials: 3,
        ..config(2, 4)
    });

    manager.submit(Job::failing(0)).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1000)).await;

    let gate1 = Arc::new(Notify::new());
    let gate2 = Arc::new(Notify::new());
    let m = Arc::clone(&manager);
    let job = Job::gated(1, &gate1);
    let r1 = tokio::spawn(async move { m.submit(job).await });
    let m = Arc::clone(&manager);
    let job = Job::gated(2, &gate2);
    let r2 = tokio::spawn(async move { m.submit(job).await });
    eventually("two trials in flight", || upstream.in_call.load(Ordering::SeqCst) == 2).await;

    // Waiting for a connection slot still holds a trial
    let m = Arc::clone(&manager);
    let r3 = tokio::spawn(async move { m.submit(Job::ok(3)).await });
    eventually("third trial queued", || manager.stats().queue_length == 1).await;
    assert_eq!(manager.stats().breaker.trials_in_flight, 3);

    let err = manager.submit(Job::ok(4)).await.unwrap_err();
    assert!(matches!(err, ManagerError::CircuitOpen { .. }), "got {:?}", err);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.stats().queue_length, 1);

    gate1.notify_one();
    gate2.notify_one();
    assert_eq!(r1.await.unwrap().unwrap(), 1);
    assert_eq!(r2.await.unwrap().unwrap(), 2);
    assert_eq!(r3.await.unwrap().unwrap(), 3);

    let stats = manager.stats();
    assert_eq!(stats.breaker_state, CircuitState::Closed);
    assert_eq!(stats.breaker.trials_in_flight, 0);
}

#[tokio::test]
async fn test_successes_decay_failure_count() {
    let (manager, _upstream) = manager(ManagerConfig {
        failure_threshold: 3,
        ..config(2, 4)
    });

    // Two failures, one success, two failures: never three net failures
    manager.submit(Job::failing(1)).await.unwrap_err();
    manager.submit(Job::failing(2)).await.unwrap_err();
    manager.submit(Job::ok(3)).await.unwrap();
    assert_eq!(manager.stats().failure_count, 1);
    manager.submit(Job::failing(4)).await.unwrap_err();
    assert_eq!(manager.stats().breaker_state, CircuitState::Closed);

    manager.submit(Job::failing(5)).await.unwrap_err();
    assert_eq!(manager.stats().breaker_state, CircuitState::Open);
}

#[tokio::test]
async fn test_queued_request_times_out() {
    let (manager, upstream) = manager(config(1, 2));
    let gate = Arc::new(Notify::new());

    let m = Arc::clone(&manager);
    let job = Job::gated(1, &gate);
    let r1 = tokio::spawn(async move { m.submit(job).await });
    eventually("first call in flight", || upstream.in_call.load(Ordering::SeqCst) == 1).await;

    let err = manager
        .submit_with_timeout(Job::ok(2), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::QueueTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(manager.stats().queue_length, 0);

    gate.notify_one();
    r1.await.unwrap().unwrap();
    assert_eq!(manager.stats().admission.total_queue_timeouts, 1);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unbounded_queue_timeout() {
    let (manager, upstream) = manager(config(1, 2));
    assert_eq!(manager.submit_with_timeout(Job::ok(1), Duration::MAX).await.unwrap(), 1);

    let gate = Arc::new(Notify::new());
    let m = Arc::clone(&manager);
    let job = Job::gated(2, &gate);
    let r2 = tokio::spawn(async move { m.submit(job).await });
    eventually("second call in flight", || upstream.in_call.load(Ordering::SeqCst) == 1).await;

    let m = Arc::clone(&manager);
    let r3 = tokio::spawn(async move { m.submit_with_timeout(Job::ok(3), Duration::MAX).await });
    eventually("third request queued", || manager.stats().queue_length == 1).await;

    gate.notify_one();
    assert_eq!(r2.await.unwrap().unwrap(), 2);
    assert_eq!(r3.await.unwrap().unwrap(), 3);
}

#[tokio::test]
async fn test_batch_keeps_input_order_with_partial_failure() {
    let (manager, upstream) = manager(config(2, 2));

    let jobs = vec![Job::ok(0), Job::failing(1), Job::ok(2), Job::ok(3), Job::failing(4), Job::ok(5)];
    let results = manager.submit_batch(jobs).await;

    assert_eq!(results.len(), 6);
    for (i, result) in results.iter().enumerate() {
        match result {
            Ok(id) => assert_eq!(*id as usize, i),
            Err(e) => {
                assert!(i == 1 || i == 4, "unexpected failure at {}: {}", i, e);
                assert!(matches!(e, ManagerError::Upstream(_)));
            }
        }
    }
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);

    // Batches pace themselves to the concurrency limit instead of filling the queue
    let stats = manager.stats();
    assert_eq!(stats.admission.total_queue_full, 0);
    assert!(upstream.max_in_call.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_empty_batch() {
    let (manager, upstream) = manager(config(2, 2));
    assert!(manager.submit_batch(Vec::new()).await.is_empty());
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_warmup_prepares_connections_for_traffic() {
    let (manager, upstream) = manager(ManagerConfig {
        warmup_target_count: 2,
        ..config(4, 4)
    });

    let report = manager.warm_up().await;
    assert_eq!(report.warmed, 2);
    assert_eq!(upstream.pings.load(Ordering::SeqCst), 2);

    let stats = manager.stats();
    assert_eq!(stats.pooled_idle, 2);
    assert_eq!(stats.pool.warm_idle_connections, 2);
    assert_eq!(stats.admission.total_admitted, 0);

    manager.submit(Job::ok(1)).await.unwrap();
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 2);
    assert_eq!(manager.stats().pool.total_reused, 1);
}

#[tokio::test]
async fn test_failed_warmup_leaves_breaker_alone() {
    let (manager, upstream) = manager(ManagerConfig {
        failure_threshold: 1,
        ..config(4, 4)
    });
    upstream.fail_pings.store(true, Ordering::SeqCst);

    for _ in 0..5 {
        assert_eq!(manager.warm_up().await.failed, 1);
    }

    let stats = manager.stats();
    assert_eq!(stats.breaker_state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.active_connections, 0);

    assert_eq!(manager.submit(Job::ok(7)).await.unwrap(), 7);
}

#[tokio::test]
async fn test_warmup_yields_last_slot_to_request() {
    let (manager, upstream) = manager(ManagerConfig {
        warmup_target_count: 1,
        ..config(1, 1)
    });
    upstream.hang_pings.store(true, Ordering::SeqCst);

    let m = Arc::clone(&manager);
    let warm = tokio::spawn(async move { m.warm_up().await });
    eventually("warmup ping in flight", || upstream.pings.load(Ordering::SeqCst) == 1).await;
    assert_eq!(manager.stats().active_connections, 1);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        manager.submit_with_timeout(Job::ok(1), Duration::from_millis(100)),
    )
    .await
    .expect("request stuck behind warmup");
    assert_eq!(result.unwrap(), 1);

    let report = warm.await.unwrap();
    assert_eq!(report.warmed, 0);
    assert_eq!(report.yielded, 1);

    let stats = manager.stats();
    assert_eq!(stats.breaker.total_failures, 0);
    assert_eq!(stats.pooled_idle, 1);
}

#[tokio::test]
async fn test_zero_warmup_interval_rejected() {
    let config = config(2, 2);
    let settings = WarmupSettings {
        interval: Duration::ZERO,
        ..WarmupSettings::from(&config)
    };

    let result = Manager::with_warmup(config, ScriptedUpstream::default(), settings);
    assert!(matches!(result.err(), Some(ConfigError::NotPositive("warmup_interval"))));
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_warmup_runs_after_initial_delay() {
    let upstream = ScriptedUpstream::default();
    let config = ManagerConfig {
        warmup_target_count: 2,
        ..config(4, 4)
    };
    let manager = Manager::new(config, upstream.clone()).unwrap();

    tokio::time::sleep(WARMUP_INITIAL_DELAY + Duration::from_millis(10)).await;
    assert_eq!(manager.stats().pooled_idle, 2);

    manager.shutdown().await;
    assert_eq!(manager.stats().active_connections, 0);
}

#[tokio::test]
async fn test_connection_failure_counts_against_breaker() {
    let (manager, upstream) = manager(ManagerConfig {
        failure_threshold: 2,
        ..config(2, 2)
    });
    upstream.fail_connects.store(true, Ordering::SeqCst);

    for id in 0..2 {
        let err = manager.submit(Job::ok(id)).await.unwrap_err();
        assert!(matches!(err, ManagerError::ConnectionCreation(_)));
    }

    let stats = manager.stats();
    assert_eq!(stats.breaker_state, CircuitState::Open);
    assert_eq!(stats.pool.failed_attempts, 2);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transport_error_discards_connection() {
    let (manager, upstream) = manager(config(2, 2));

    manager.submit(Job::broken_pipe(1)).await.unwrap_err();
    assert_eq!(manager.stats().active_connections, 0);
    assert_eq!(manager.stats().pool.total_discarded, 1);

    manager.submit(Job::failing(2)).await.unwrap_err();
    assert_eq!(manager.stats().pooled_idle, 1);

    manager.submit(Job::ok(3)).await.unwrap();
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_rejects_queue_and_drains() {
    let (manager, upstream) = manager(config(1, 1));
    let gate = Arc::new(Notify::new());

    let m = Arc::clone(&manager);
    let job = Job::gated(1, &gate);
    let r1 = tokio::spawn(async move { m.submit(job).await });
    eventually("first call in flight", || upstream.in_call.load(Ordering::SeqCst) == 1).await;

    let m = Arc::clone(&manager);
    let r2 = tokio::spawn(async move { m.submit(Job::ok(2)).await });
    eventually("second request queued", || manager.stats().queue_length == 1).await;

    let m = Arc::clone(&manager);
    let shutdown = tokio::spawn(async move { m.shutdown().await });

    assert!(matches!(r2.await.unwrap(), Err(ManagerError::ShuttingDown)));
    assert!(manager.is_shut_down());
    assert!(!shutdown.is_finished());

    gate.notify_one();
    assert_eq!(r1.await.unwrap().unwrap(), 1);
    shutdown.await.unwrap();

    assert_eq!(manager.stats().active_connections, 0);
    assert!(matches!(
        manager.submit(Job::ok(3)).await,
        Err(ManagerError::ShuttingDown)
    ));
}
