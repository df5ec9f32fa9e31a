//! Connection & resilience manager
//!
//! The [`Manager`] ties the components together for every upstream call:
//!
//! 1. the admission controller checks the circuit breaker, then admits,
//!    queues or rejects the request
//! 2. an admitted request leases a pooled connection, creating one if the
//!    pool has room
//! 3. the upstream call runs to completion
//! 4. the outcome is reported to the breaker, the connection goes back to
//!    the pool and the admission slot passes to the next queued request
//!
//! The warmup scheduler runs beside this path on its own budget.

mod batch;
mod stats;

pub use stats::ManagerStats;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, Admitted, DEFAULT_QUEUE_TIMEOUT};
use crate::config::ManagerConfig;
use crate::error::{ConfigError, ManagerError};
use crate::pool::{Acquire, CircuitBreaker, CircuitBreakerConfig, ConnectionPool, Lease, PoolConfig};
use crate::upstream::Upstream;
use crate::warmup::{Warmer, WarmupReport, WarmupScheduler, WarmupSettings};

/// Deadline offset used when a queue timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Mediates every call to one upstream completion API
pub struct Manager<U: Upstream> {
    config: ManagerConfig,
    upstream: Arc<U>,
    pool: ConnectionPool<U::Handle>,
    breaker: Arc<CircuitBreaker>,
    admission: Arc<AdmissionController>,
    warmup: Mutex<Option<WarmupScheduler>>,
    warmup_settings: WarmupSettings,
}

impl<U: Upstream> Manager<U> {
    /// Validate `config`, build the components and start the warmup scheduler.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new(config: ManagerConfig, upstream: U) -> Result<Self, ConfigError> {
        let warmup_settings = WarmupSettings::from(&config);
        Self::with_warmup(config, upstream, warmup_settings)
    }

    /// Like [`new`](Self::new), with explicit warmup timing
    pub fn with_warmup(config: ManagerConfig, upstream: U, warmup_settings: WarmupSettings) -> Result<Self, ConfigError> {
        config.validate()?;
        if warmup_settings.interval.is_zero() {
            return Err(ConfigError::NotPositive("warmup_interval"));
        }

        let upstream = Arc::new(upstream);
        let pool = ConnectionPool::new(PoolConfig::from(&config));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::from(&config));
        let admission = AdmissionController::new(
            Arc::clone(&breaker),
            config.max_connections,
            config.max_queue_size,
        );

        let manager = Self {
            config,
            upstream,
            pool,
            breaker,
            admission,
            warmup: Mutex::new(None),
            warmup_settings,
        };

        let scheduler = WarmupScheduler::start(manager.warmer());
        *manager.warmup.lock() = Some(scheduler);

        info!(
            max_connections = manager.config.max_connections,
            max_pool_size = manager.config.max_pool_size,
            max_queue_size = manager.config.max_queue_size,
            "Connection manager started"
        );

        Ok(manager)
    }

    fn warmer(&self) -> Warmer<U> {
        Warmer::new(
            Arc::clone(&self.upstream),
            self.pool.clone(),
            Arc::clone(&self.admission),
            self.warmup_settings,
        )
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Submit a request, waiting at most [`DEFAULT_QUEUE_TIMEOUT`] for admission
    pub async fn submit(&self, payload: U::Payload) -> Result<U::Output, ManagerError> {
        self.submit_with_timeout(payload, DEFAULT_QUEUE_TIMEOUT).await
    }

    /// Submit a request, waiting at most `queue_timeout` for admission
    pub async fn submit_with_timeout(
        &self,
        payload: U::Payload,
        queue_timeout: Duration,
    ) -> Result<U::Output, ManagerError> {
        let now = Instant::now();
        let deadline = now.checked_add(queue_timeout).unwrap_or(now + FAR_FUTURE);
        let Admitted { permit, ticket, waited } = self.admission.admit(deadline).await?;

        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis() as u64, "Request admitted from queue");
        }

        let result = self.execute(payload).await;

        match &result {
            Ok(_) => ticket.record_success(),
            Err(_) => ticket.record_failure(),
        }
        drop(permit);

        result
    }

    async fn execute(&self, payload: U::Payload) -> Result<U::Output, ManagerError> {
        let mut lease = self.lease_connection().await?;
        lease.mark_used();

        match self.upstream.call(lease.handle_mut(), payload).await {
            Ok(output) => {
                lease.release();
                Ok(output)
            }
            Err(e) => {
                warn!(conn_id = lease.id(), error = %e, "Upstream call failed");
                if e.poisons_connection() {
                    lease.discard();
                } else {
                    lease.release();
                }
                Err(ManagerError::Upstream(e))
            }
        }
    }

    /// Lease a pooled connection, creating one if there is room.
    ///
    /// Idle handles the upstream reports dead are discarded on the way.
    /// Slots can only be exhausted here while warmup holds some of them;
    /// warmup gives them up as soon as it is asked to.
    async fn lease_connection(&self) -> Result<Lease<U::Handle>, ManagerError> {
        loop {
            let released = self.pool.released();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.pool.acquire_where(|handle| self.upstream.is_reusable(handle)) {
                Acquire::Idle(lease) => return Ok(lease),
                Acquire::Create(reservation) => {
                    let conn_id = reservation.id();
                    return match self.upstream.connect().await {
                        Ok(handle) => Ok(reservation.fulfill(handle, false)),
                        Err(e) => {
                            warn!(conn_id, error = %e, "Failed to create upstream connection");
                            Err(ManagerError::ConnectionCreation(e))
                        }
                    };
                }
                Acquire::Blocked => {
                    debug!("All connection slots busy, asking warmup to yield");
                    self.pool.request_slot();
                    released.await;
                }
            }
        }
    }

    /// Run one warmup tick now, outside the schedule
    pub async fn warm_up(&self) -> WarmupReport {
        self.warmer().tick().await
    }

    /// Snapshot of pool, breaker and queue state
    pub fn stats(&self) -> ManagerStats {
        ManagerStats::collect(&self.pool, &self.breaker, &self.admission)
    }

    /// Stop warmup, reject queued requests, let in-flight requests drain,
    /// then drop pooled connections.
    pub async fn shutdown(&self) {
        let rejected = self.admission.close();

        let scheduler = self.warmup.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }

        let in_flight = self.admission.current_requests();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight requests to drain");
        }
        self.admission.wait_idle().await;

        let closed = self.pool.close();
        info!(rejected, closed, "Connection manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.admission.is_closed()
    }
}

impl<U: Upstream> Drop for Manager<U> {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.warmup.get_mut().take() {
            scheduler.stop();
        }
        self.admission.close();
    }
}
