//! Error taxonomy returned by the manager

use std::time::Duration;

use crate::upstream::UpstreamError;

/// Errors surfaced by [`Manager::submit`](crate::Manager::submit)
///
/// Admission rejections (`CircuitOpen`, `QueueFull`, `QueueTimeout`) are
/// never retried inside the manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManagerError {
    #[error("circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("system overloaded: wait queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("request waited {waited:?} in queue without being admitted")]
    QueueTimeout { waited: Duration },

    #[error("failed to create upstream connection: {0}")]
    ConnectionCreation(#[source] UpstreamError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("manager is shutting down")]
    ShuttingDown,
}

impl ManagerError {
    /// Rejected before reaching the upstream
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            ManagerError::CircuitOpen { .. }
                | ManagerError::QueueFull { .. }
                | ManagerError::QueueTimeout { .. }
        )
    }

    /// Whether a caller may reasonably retry later
    pub fn is_retryable(&self) -> bool {
        match self {
            ManagerError::QueueTimeout { .. } | ManagerError::ConnectionCreation(_) => true,
            ManagerError::Upstream(e) => e.is_transient(),
            ManagerError::CircuitOpen { .. } | ManagerError::QueueFull { .. } | ManagerError::ShuttingDown => false,
        }
    }
}

/// Invalid manager configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),

    #[error("max_pool_size ({max_pool_size}) exceeds max_connections ({max_connections})")]
    PoolLargerThanConnections {
        max_pool_size: u64,
        max_connections: u64,
    },

    #[error("invalid upstream endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rejections() {
        assert!(ManagerError::QueueFull { capacity: 1 }.is_admission_rejection());
        assert!(ManagerError::CircuitOpen { retry_in: Duration::ZERO }.is_admission_rejection());
        assert!(!ManagerError::ShuttingDown.is_admission_rejection());
        assert!(!ManagerError::Upstream(UpstreamError::Transport("x".into())).is_admission_rejection());
    }

    #[test]
    fn test_upstream_error_is_verbatim() {
        let inner = UpstreamError::Status { status: 500, body: "boom".into() };
        let err = ManagerError::from(inner.clone());
        assert_eq!(err.to_string(), inner.to_string());
        assert!(err.is_retryable());
    }
}
