//! # Service Metrics
//!
//! Purpose: Name every series the client reports and forward observations to
//! the injected [`MetricsSink`].
//!
//! ## Notes
//! - All names share the `pubkv_` namespace plus an optional caller prefix,
//!   normalized to end with `_`.

use std::sync::Arc;
use std::time::Duration;

use pubkv_common::{MetricsSink, NoopMetrics};

use crate::pool::PoolStats;

/// Method label for publish calls.
pub const PUBLISH_METHOD: &str = "Publish";
/// Method label for subscribe calls.
pub const SUBSCRIBE_METHOD: &str = "Subscribe";
/// Method label for request/response commands.
pub const DO_METHOD: &str = "Do";
/// Method label for buffered commands.
pub const SEND_METHOD: &str = "Send";

/// Naming options for the reported series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsOptions {
    /// Inserted after `pubkv_`; `_` is appended when missing.
    pub prefix: String,
}

/// Fully qualified series names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNames {
    pub subscriptions_active: String,
    pub publish_traffic_size: String,
    pub subscribe_success: String,
    pub subscribe_failures: String,
    pub command_calls: String,
    pub method_calls: String,
    pub method_duration: String,
    pub pool_active_connections: String,
    pub pool_idle_connections: String,
}

impl MetricNames {
    /// Builds the names for `options`.
    pub fn new(options: &MetricsOptions) -> Self {
        let mut prefix = options.prefix.clone();
        if !prefix.is_empty() && !prefix.ends_with('_') {
            prefix.push('_');
        }
        let name = |base: &str| format!("pubkv_{}{}", prefix, base);
        MetricNames {
            subscriptions_active: name("subscriptions_active"),
            publish_traffic_size: name("publish_traffic_size"),
            subscribe_success: name("subscribe_success"),
            subscribe_failures: name("subscribe_failures"),
            command_calls: name("command_calls"),
            method_calls: name("method_calls"),
            method_duration: name("method_duration"),
            pool_active_connections: name("pool_active_connections"),
            pool_idle_connections: name("pool_idle_connections"),
        }
    }
}

impl Default for MetricNames {
    fn default() -> Self {
        MetricNames::new(&MetricsOptions::default())
    }
}

/// Sink plus names, shared by the service, its connections and its sessions.
pub struct ServiceMetrics {
    sink: Arc<dyn MetricsSink>,
    names: MetricNames,
}

impl ServiceMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>, options: &MetricsOptions) -> Self {
        ServiceMetrics {
            sink,
            names: MetricNames::new(options),
        }
    }

    pub fn names(&self) -> &MetricNames {
        &self.names
    }

    pub(crate) fn method_call(&self, method: &str) {
        self.sink
            .increment_counter(&self.names.method_calls, &[("method", method)]);
    }

    pub(crate) fn command_call(&self, method: &str, command: &str) {
        self.sink.increment_counter(
            &self.names.command_calls,
            &[("method", method), ("command", command)],
        );
    }

    pub(crate) fn command_duration(&self, method: &str, command: &str, elapsed: Duration) {
        self.sink.increment_counter_by(
            &self.names.method_duration,
            &[("method", method), ("command", command)],
            elapsed.as_secs_f64(),
        );
    }

    pub(crate) fn publish_traffic(&self, bytes: usize) {
        self.sink
            .increment_counter_by(&self.names.publish_traffic_size, &[], bytes as f64);
    }

    pub(crate) fn subscription_opened(&self) {
        self.sink.inc_gauge(&self.names.subscriptions_active, &[]);
    }

    pub(crate) fn subscription_closed(&self) {
        self.sink.dec_gauge(&self.names.subscriptions_active, &[]);
    }

    pub(crate) fn subscribe_outcome<T, E>(&self, result: &Result<T, E>) {
        let name = match result {
            Ok(_) => &self.names.subscribe_success,
            Err(_) => &self.names.subscribe_failures,
        };
        self.sink.increment_counter(name, &[]);
    }

    pub(crate) fn pool_stats(&self, stats: PoolStats) {
        self.sink.set_gauge(
            &self.names.pool_active_connections,
            &[],
            stats.active_count as f64,
        );
        self.sink
            .set_gauge(&self.names.pool_idle_connections, &[], stats.idle_count as f64);
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        ServiceMetrics::new(Arc::new(NoopMetrics), &MetricsOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubkv_common::MemoryMetrics;

    #[test]
    fn default_names_have_no_prefix() {
        let names = MetricNames::default();
        assert_eq!(names.subscriptions_active, "pubkv_subscriptions_active");
        assert_eq!(names.pool_idle_connections, "pubkv_pool_idle_connections");
    }

    #[test]
    fn prefix_gets_separator_once() {
        let names = MetricNames::new(&MetricsOptions {
            prefix: "mabel".to_string(),
        });
        assert_eq!(names.command_calls, "pubkv_mabel_command_calls");

        let names = MetricNames::new(&MetricsOptions {
            prefix: "mabel_".to_string(),
        });
        assert_eq!(names.command_calls, "pubkv_mabel_command_calls");
    }

    #[test]
    fn pool_stats_become_gauges() {
        let sink = Arc::new(MemoryMetrics::new());
        let metrics = ServiceMetrics::new(sink.clone(), &MetricsOptions::default());
        metrics.pool_stats(PoolStats {
            active_count: 10,
            idle_count: 7,
        });
        assert_eq!(sink.gauge("pubkv_pool_active_connections", &[]), 10.0);
        assert_eq!(sink.gauge("pubkv_pool_idle_connections", &[]), 7.0);
    }
}
