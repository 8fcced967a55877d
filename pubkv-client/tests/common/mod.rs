#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pubkv_client::{Configuration, KVService, MemoryMetrics, MetricsOptions, PubSubConfiguration};
use pubkv_server::ServerHandle;

/// Upper bound for any single step of a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn backend() -> ServerHandle {
    pubkv_server::spawn("127.0.0.1:0").await.expect("spawn backend")
}

pub fn configuration(server: &ServerHandle) -> Configuration {
    Configuration {
        max_idle: 4,
        pubsub: PubSubConfiguration {
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_millis(50),
        },
        ..Configuration::new(server.addr().to_string())
    }
}

pub fn configured(server: &ServerHandle) -> KVService {
    let service = KVService::new();
    service
        .apply_configuration(configuration(server))
        .expect("apply configuration");
    service
}

pub async fn running(server: &ServerHandle) -> KVService {
    let service = configured(server);
    service.start().await.expect("start");
    service
}

pub async fn running_with_metrics(server: &ServerHandle, prefix: &str) -> (KVService, Arc<MemoryMetrics>) {
    let metrics = Arc::new(MemoryMetrics::new());
    let service = KVService::with_metrics(
        metrics.clone(),
        MetricsOptions {
            prefix: prefix.to_string(),
        },
    );
    service
        .apply_configuration(configuration(server))
        .expect("apply configuration");
    service.start().await.expect("start");
    (service, metrics)
}
