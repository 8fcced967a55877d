//! # PubKV Client
//!
//! Purpose: Give applications a small async facade over a Redis-compatible
//! backend: pooled command execution, publishing, and supervised
//! subscriptions with health checks and cooperative cancellation.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections and re-check the ones that
//!    sat idle for too long before lending them out.
//! 2. **Dedicated Subscriptions**: Each subscribe call owns one connection with
//!    exactly one reader task.
//! 3. **Contained Failures**: Callback errors and panics come back as
//!    `ServiceError` values instead of tearing down the caller.
//! 4. **Pluggable Telemetry**: Metrics go through a `MetricsSink` trait object;
//!    logs go through `tracing`.

mod config;
mod conn;
mod error;
mod instrument;
mod metrics;
mod pool;
mod publish;
mod pubsub;
mod recovery;
mod service;
mod state;

pub use config::{
    Configuration, PubSubConfiguration, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_WRITE_TIMEOUT,
    READ_TIMEOUT_MARGIN,
};
pub use conn::{ConnReader, ConnWriter, Connection, DialOptions};
pub use error::{HandlerResult, ServiceError, ServiceResult};
pub use instrument::InstrumentedConnection;
pub use metrics::{
    MetricNames, MetricsOptions, ServiceMetrics, DO_METHOD, PUBLISH_METHOD, SEND_METHOD,
    SUBSCRIBE_METHOD,
};
pub use pool::{
    test_on_borrow, ConnectionPool, PoolConfig, PoolStats, PooledConnection, BORROW_TEST_THRESHOLD,
};
pub use publish::Payload;
pub use pubsub::{Message, SessionState};
pub use recovery::UNMAPPED_PANIC;
pub use service::KVService;
pub use state::ServiceState;

pub use pubkv_common::{MemoryMetrics, MetricsSink, NoopMetrics, RespValue};
pub use tokio_util::sync::CancellationToken;
