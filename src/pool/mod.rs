//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A bounded pool of reusable upstream connections with TTL eviction
//! - A circuit breaker state machine guarding the upstream
//! - Exactly-once release of connection slots through RAII guards

pub mod circuit;
pub mod connection;

pub use circuit::{BreakerTicket, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{Acquire, Connection, ConnectionId, ConnectionPool, Lease, PoolConfig, PoolStats, Reservation};
