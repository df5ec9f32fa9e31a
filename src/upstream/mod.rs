//! Upstream collaborator boundary
//!
//! The manager never speaks the provider's wire format. It only needs to:
//! - establish a connection handle
//! - issue a request through a handle
//! - send a lightweight ping through a handle (used by warmup)
//! - tell whether an idle handle is still alive
//!
//! [`http::HttpUpstream`] is the bundled HTTP/1.1 implementation.

pub mod http;

use std::future::Future;
use std::time::Duration;

pub use http::HttpUpstream;

/// Failure reported by an upstream call
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Whether the connection that produced this error must not be reused
    pub fn poisons_connection(&self) -> bool {
        matches!(self, UpstreamError::Transport(_) | UpstreamError::Timeout(_))
    }

    /// Whether retrying later has a reasonable chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) | UpstreamError::Timeout(_) => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Capability to reach the generative-AI provider.
///
/// Handles are lent to exactly one call at a time, so implementations may
/// keep per-connection state in `Handle` without synchronization.
pub trait Upstream: Send + Sync + 'static {
    /// An established connection to the provider
    type Handle: Send + 'static;

    /// Request body handed through by callers
    type Payload: Send + 'static;

    /// Successful response returned to callers
    type Output: Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Handle, UpstreamError>> + Send;

    fn call(
        &self,
        handle: &mut Self::Handle,
        payload: Self::Payload,
    ) -> impl Future<Output = Result<Self::Output, UpstreamError>> + Send;

    fn ping(&self, handle: &mut Self::Handle) -> impl Future<Output = Result<(), UpstreamError>> + Send;

    /// Whether an idle pooled handle can still carry a request.
    ///
    /// Checked before a pooled handle is lent out; dead handles are discarded.
    fn is_reusable(&self, _handle: &Self::Handle) -> bool {
        true
    }
}
