//! genpool - connection pooling, admission control and circuit breaking
//! for generative-AI completion APIs

pub mod admission;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod upstream;
pub mod warmup;

pub use admission::DEFAULT_QUEUE_TIMEOUT;
pub use config::{Config, ManagerConfig, UpstreamConfig};
pub use error::{ConfigError, ManagerError};
pub use manager::{Manager, ManagerStats};
pub use pool::CircuitState;
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
