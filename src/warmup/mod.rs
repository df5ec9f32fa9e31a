//! Background warmup of pooled connections
//!
//! Shortly after startup, and then on a fixed interval, the scheduler:
//! - evicts idle connections older than the connection TTL
//! - creates fresh connections until the idle set reaches the warm target,
//!   pinging each one before it is pooled
//!
//! Warmup works directly on the pool. It never takes an admission slot and
//! never reports to the circuit breaker, so a failing ping cannot trip the
//! breaker that guards user traffic. It also stands aside while user
//! requests are saturating the system, and abandons a warm-up in progress
//! when an admitted request finds no free connection slot.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::ManagerConfig;
use crate::pool::{ConnectionPool, Reservation};
use crate::upstream::{Upstream, UpstreamError};

/// Delay between scheduler start and the first warmup tick
pub const WARMUP_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Timing and sizing of warmup
#[derive(Debug, Clone, Copy)]
pub struct WarmupSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub target_count: usize,
    pub connection_ttl: Duration,
}

impl From<&ManagerConfig> for WarmupSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            initial_delay: WARMUP_INITIAL_DELAY,
            interval: config.warmup_interval(),
            target_count: config.warmup_target_count,
            connection_ttl: config.connection_ttl(),
        }
    }
}

/// What a single warmup tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Expired idle connections removed
    pub evicted: usize,

    /// Connections created, pinged and pooled
    pub warmed: usize,

    /// Connections that failed to connect or ping
    pub failed: usize,

    /// Warm-ups abandoned because a user request needed the slot
    pub yielded: usize,
}

/// Performs warmup ticks against a pool
pub struct Warmer<U: Upstream> {
    upstream: Arc<U>,
    pool: ConnectionPool<U::Handle>,
    admission: Arc<AdmissionController>,
    settings: WarmupSettings,
}

impl<U: Upstream> Warmer<U> {
    pub fn new(
        upstream: Arc<U>,
        pool: ConnectionPool<U::Handle>,
        admission: Arc<AdmissionController>,
        settings: WarmupSettings,
    ) -> Self {
        Self {
            upstream,
            pool,
            admission,
            settings,
        }
    }

    /// Evict expired connections, then top the idle set up to the warm target
    pub async fn tick(&self) -> WarmupReport {
        let mut report = WarmupReport {
            evicted: self.pool.evict_expired(self.settings.connection_ttl),
            ..WarmupReport::default()
        };

        let target = self.settings.target_count.min(self.pool.config().max_pool_size);

        while self.pool.idle_connections() < target {
            if self.admission.queue_len() > 0
                || self.admission.current_requests() >= self.admission.max_concurrent()
            {
                debug!("User traffic saturating the system, deferring warmup");
                break;
            }

            // Enabled before reserving so a user request blocked on our
            // reservation is never missed
            let wanted = self.pool.slot_wanted();
            tokio::pin!(wanted);
            wanted.as_mut().enable();

            let Some(reservation) = self.pool.try_reserve() else {
                debug!("No free connection slot for warmup");
                break;
            };
            let conn_id = reservation.id();

            // Dropping the in-flight warm-up gives its slot back
            let outcome = tokio::select! {
                biased;
                _ = wanted.as_mut() => None,
                outcome = self.warm_one(reservation) => Some(outcome),
            };

            match outcome {
                Some(Ok(())) => report.warmed += 1,
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "Warmup connection failed");
                    report.failed += 1;
                    break;
                }
                None => {
                    debug!(conn_id, "User request needs the slot, abandoning warmup");
                    report.yielded += 1;
                    break;
                }
            }
        }

        report
    }

    /// Connect through `reservation`, ping, and pool the connection
    async fn warm_one(&self, reservation: Reservation<U::Handle>) -> Result<(), UpstreamError> {
        let handle = self.upstream.connect().await?;

        let mut lease = reservation.fulfill(handle, true);
        match self.upstream.ping(lease.handle_mut()).await {
            Ok(()) => {
                lease.release();
                Ok(())
            }
            Err(e) => {
                lease.discard();
                Err(e)
            }
        }
    }
}

/// Handle to the background warmup task
pub struct WarmupScheduler {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WarmupScheduler {
    /// Spawn the warmup task
    pub fn start<U: Upstream>(warmer: Warmer<U>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let settings = warmer.settings;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(settings.initial_delay) => {}
            }

            info!(
                interval_ms = settings.interval.as_millis() as u64,
                target = settings.target_count,
                "Warmup scheduler started"
            );

            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // An in-flight tick is abandoned on cancellation; its
                // reservation or lease gives the slot back on drop.
                tokio::select! {
                    _ = token.cancelled() => break,
                    report = warmer.tick() => {
                        debug!(
                            evicted = report.evicted,
                            warmed = report.warmed,
                            failed = report.failed,
                            yielded = report.yielded,
                            "Warmup tick completed"
                        );
                    }
                }
            }

            debug!("Warmup scheduler stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel the timer and abandon any in-flight warmup call
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WarmupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
