//! # Service Facade
//!
//! Purpose: Own the configuration, the lifecycle state and the connection pool,
//! and hand out instrumented connections to callers.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVService` hides pooling, metrics and lifecycle.
//! 2. **Cheap Clones**: The handle is an `Arc`, so callbacks can capture a
//!    clone and publish from inside a subscription.
//! 3. **Serialized Transitions**: Start/stop/restart run under one async lock;
//!    readers of the state never wait on it.
//!
//! ## Notes
//! - `stop` always lands in `Stopped`. If closing the pool fails the error is
//!   still returned, but the service does not linger in a half-stopped state.

use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{info, warn};

use pubkv_common::{MetricsSink, NoopMetrics};

use crate::config::Configuration;
use crate::conn::DialOptions;
use crate::error::ServiceResult;
use crate::instrument::InstrumentedConnection;
use crate::metrics::{MetricsOptions, ServiceMetrics};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::state::{ServiceState, StateCell};

struct ServiceInner {
    configuration: RwLock<Configuration>,
    state: StateCell,
    transition: Mutex<()>,
    metrics: Arc<ServiceMetrics>,
}

/// Handle to the backend: pooled commands, publish and subscribe.
#[derive(Clone)]
pub struct KVService {
    inner: Arc<ServiceInner>,
}

impl Default for KVService {
    fn default() -> Self {
        KVService::new()
    }
}

impl KVService {
    /// Creates a stopped service that discards metrics.
    pub fn new() -> Self {
        KVService::with_metrics(Arc::new(NoopMetrics), MetricsOptions::default())
    }

    /// Creates a stopped service reporting into `sink`.
    pub fn with_metrics(sink: Arc<dyn MetricsSink>, options: MetricsOptions) -> Self {
        KVService {
            inner: Arc::new(ServiceInner {
                configuration: RwLock::new(Configuration::default()),
                state: StateCell::new(),
                transition: Mutex::new(()),
                metrics: Arc::new(ServiceMetrics::new(sink, &options)),
            }),
        }
    }

    /// Applies a typed configuration, filling defaults and validating it.
    ///
    /// Takes effect on the next `start` and on every later subscribe.
    pub fn apply_configuration(&self, configuration: Configuration) -> ServiceResult<()> {
        let configuration = configuration.with_defaults();
        configuration.validate()?;
        *self
            .inner
            .configuration
            .write()
            .expect("configuration lock poisoned") = configuration;
        Ok(())
    }

    /// Applies a loosely typed configuration.
    ///
    /// Input of the wrong shape fails with `ServiceError::WrongConfiguration`.
    pub fn apply_configuration_value(&self, value: serde_json::Value) -> ServiceResult<()> {
        self.apply_configuration(Configuration::from_value(value)?)
    }

    /// Returns a copy of the applied configuration.
    pub fn configuration(&self) -> Configuration {
        self.inner
            .configuration
            .read()
            .expect("configuration lock poisoned")
            .clone()
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    /// Creates the pool and verifies the backend answers PING.
    ///
    /// The state only becomes `Running` once both the dial and the PING
    /// succeed; otherwise the error is returned untouched. Calling it while
    /// running is a no-op.
    pub async fn start(&self) -> ServiceResult<()> {
        let _transition = self.inner.transition.lock().await;
        self.start_locked().await
    }

    /// Closes the pool and moves to `Stopped`. A no-op while stopped.
    pub async fn stop(&self) -> ServiceResult<()> {
        let _transition = self.inner.transition.lock().await;
        self.stop_locked().await
    }

    /// Stops the service if it is running, then starts it.
    ///
    /// Both steps run under one transition lock, so no concurrent `start` or
    /// `stop` lands in between.
    pub async fn restart(&self) -> ServiceResult<()> {
        let _transition = self.inner.transition.lock().await;
        if self.inner.state.is_running() {
            self.stop_locked().await?;
        }
        self.start_locked().await
    }

    // Callers hold `transition`.
    async fn start_locked(&self) -> ServiceResult<()> {
        if self.inner.state.is_running() {
            return Ok(());
        }

        let configuration = self.configuration();
        let pool = ConnectionPool::new(PoolConfig {
            addr: configuration.address.clone(),
            max_idle: configuration.max_idle,
            max_active: configuration.max_active,
            idle_timeout: configuration.idle_timeout,
            dial: DialOptions::default(),
        });

        let mut check = pool.dial().await?;
        check.ping().await?;
        drop(check);

        self.inner.state.set_running(pool);
        info!(addr = %configuration.address, "service started");
        Ok(())
    }

    // Callers hold `transition`.
    async fn stop_locked(&self) -> ServiceResult<()> {
        let Some(pool) = self.inner.state.set_stopped() else {
            return Ok(());
        };

        let result = pool.close().await;
        match &result {
            Ok(()) => info!("service stopped"),
            Err(err) => warn!(error = %err, "service stopped with pool close error"),
        }
        result
    }

    /// Acquires an instrumented connection; dropping it releases it.
    pub async fn get_conn(&self) -> ServiceResult<InstrumentedConnection> {
        let pool = self.inner.state.pool()?;
        let conn = pool.acquire().await?;
        Ok(InstrumentedConnection::new(conn, self.inner.metrics.clone()))
    }

    /// Runs `handler` with a pooled connection.
    ///
    /// The connection is released on every return path of `handler`. A panic
    /// inside `handler` is not caught and unwinds into the caller.
    ///
    /// ```no_run
    /// # async fn demo(service: pubkv_client::KVService) -> pubkv_client::ServiceResult<()> {
    /// let reply = service
    ///     .run_with_conn(|conn| Box::pin(async move { conn.do_command(&[b"PING"]).await }))
    ///     .await?;
    /// # let _ = reply;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_with_conn<T, F>(&self, handler: F) -> ServiceResult<T>
    where
        F: for<'c> FnOnce(&'c mut InstrumentedConnection) -> BoxFuture<'c, ServiceResult<T>>,
    {
        let mut conn = self.get_conn().await?;
        handler(&mut conn).await
    }

    /// Pushes the pool's active and idle counts into the pool gauges.
    ///
    /// Does nothing while stopped.
    pub fn record_pool_stats(&self) {
        if let Ok(pool) = self.inner.state.pool() {
            self.inner.metrics.pool_stats(pool.stats());
        }
    }

    /// Metric names and sink used by this service.
    pub fn metrics(&self) -> &ServiceMetrics {
        &self.inner.metrics
    }

    pub(crate) fn metrics_handle(&self) -> Arc<ServiceMetrics> {
        self.inner.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts connections and answers every read with +PONG.
    async fn pong_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(b"+PONG\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_restarts_and_stops_serialize() {
        let service = KVService::new();
        service
            .apply_configuration(Configuration::new(pong_server().await))
            .unwrap();
        service.start().await.unwrap();

        let mut tasks = Vec::new();
        for round in 0..16 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                if round % 2 == 0 {
                    service.restart().await
                } else {
                    service.stop().await
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Whatever the interleaving, a final restart always lands in Running
        // with exactly one live pool.
        service.restart().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        let _conn = service.get_conn().await.unwrap();
        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }
}
