use std::fmt;

use crate::admission::{AdmissionController, AdmissionStats};
use crate::pool::{CircuitBreaker, CircuitState, CircuitStats, ConnectionPool, PoolStats};

/// Read-only snapshot of manager state.
///
/// Each component's figures are copied under that component's own lock.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    /// Connections in existence, idle or lent
    pub active_connections: usize,

    /// Idle connections ready for reuse
    pub pooled_idle: usize,

    /// Requests waiting for admission
    pub queue_length: usize,

    /// Requests currently executing
    pub in_flight: usize,

    pub breaker_state: CircuitState,

    /// Leaky failure count of the circuit breaker
    pub failure_count: u32,

    pub pool: PoolStats,
    pub breaker: CircuitStats,
    pub admission: AdmissionStats,
}

impl ManagerStats {
    pub(crate) fn collect<H>(
        pool: &ConnectionPool<H>,
        breaker: &CircuitBreaker,
        admission: &AdmissionController,
    ) -> Self {
        let pool = pool.stats();
        let breaker = breaker.stats();
        let admission = admission.stats();

        Self {
            active_connections: pool.active_connections,
            pooled_idle: pool.idle_connections,
            queue_length: admission.queue_length,
            in_flight: admission.in_flight,
            breaker_state: breaker.state,
            failure_count: breaker.failure_count,
            pool,
            breaker,
            admission,
        }
    }
}

impl fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections={} idle={} in_flight={} queued={} breaker={} failures={} created={} reused={} opened={}",
            self.active_connections,
            self.pooled_idle,
            self.in_flight,
            self.queue_length,
            self.breaker_state,
            self.failure_count,
            self.pool.total_created,
            self.pool.total_reused,
            self.breaker.open_count,
        )
    }
}
