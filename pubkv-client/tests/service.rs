mod common;

use std::time::Duration;

use pubkv_client::{
    Configuration, KVService, RespValue, ServiceError, ServiceState, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_WRITE_TIMEOUT,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{backend, configured, running, WAIT};

/// Answers the first command on each connection with +PONG, then resets it.
async fn resetting_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                if matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {
                    let _ = stream.write_all(b"+PONG\r\n").await;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                reset(stream);
            });
        }
    });
    addr
}

// Closing with a zero linger sends RST instead of FIN.
#[allow(deprecated)]
fn reset(stream: TcpStream) {
    let _ = stream.set_linger(Some(Duration::ZERO));
    drop(stream);
}

#[tokio::test]
async fn start_stop_restart() {
    let server = backend().await;
    let service = configured(&server);
    assert_eq!(service.state(), ServiceState::Stopped);

    service.start().await.expect("start");
    assert_eq!(service.state(), ServiceState::Running);
    service.start().await.expect("second start is a no-op");

    service.restart().await.expect("restart");
    assert!(service.is_running());

    service.stop().await.expect("stop");
    assert_eq!(service.state(), ServiceState::Stopped);
    service.stop().await.expect("second stop is a no-op");

    service.restart().await.expect("restart from stopped");
    assert!(service.is_running());

    server.shutdown().await;
}

#[tokio::test]
async fn pool_operations_require_running() {
    let server = backend().await;
    let service = configured(&server);

    assert!(matches!(service.get_conn().await, Err(ServiceError::NotRunning)));
    assert!(matches!(
        service.publish("news", "hello").await,
        Err(ServiceError::NotRunning)
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn start_fails_when_backend_is_down() {
    let server = backend().await;
    let service = configured(&server);
    server.shutdown().await;

    let err = tokio::time::timeout(WAIT, service.start())
        .await
        .expect("start finished")
        .unwrap_err();
    assert!(matches!(err, ServiceError::Dial { .. } | ServiceError::Io(_)));
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[test]
fn configuration_defaults_and_validation() {
    let service = KVService::new();

    service
        .apply_configuration(Configuration::new("127.0.0.1:6379"))
        .expect("defaults fill pubsub timings");
    let applied = service.configuration();
    assert_eq!(applied.pubsub.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL);
    assert_eq!(applied.pubsub.read_timeout, Duration::from_secs(70));
    assert_eq!(applied.pubsub.write_timeout, DEFAULT_WRITE_TIMEOUT);

    let err = service
        .apply_configuration_value(json!({ "address": 42 }))
        .unwrap_err();
    assert!(matches!(err, ServiceError::WrongConfiguration(_)));

    let err = service
        .apply_configuration_value(json!({
            "address": "127.0.0.1:6379",
            "pubsub": { "read_timeout_ms": 1000, "health_check_interval_ms": 5000 }
        }))
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidConfiguration(_)));

    let err = service.apply_configuration(Configuration::default()).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidConfiguration(_)));

    // Rejected input leaves the previous configuration in place.
    assert_eq!(service.configuration(), applied);
}

#[tokio::test]
async fn run_with_conn_passes_through() {
    let server = backend().await;
    let service = running(&server).await;

    let reply = service
        .run_with_conn(|conn| {
            Box::pin(async move {
                conn.do_command(&[b"SET", b"greeting", b"hi"]).await?;
                conn.do_command(&[b"GET", b"greeting"]).await
            })
        })
        .await
        .expect("run_with_conn");
    assert_eq!(reply, RespValue::bulk("hi"));

    let err = service
        .run_with_conn(|_conn| Box::pin(async { Err::<(), _>(ServiceError::UnexpectedResponse) }))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnexpectedResponse));

    // The connection went back to the pool on both paths.
    let reply = service
        .run_with_conn(|conn| Box::pin(async move { conn.do_command(&[b"PING"]).await }))
        .await
        .expect("pool still usable");
    assert_eq!(reply, RespValue::Simple(b"PONG".to_vec()));

    server.shutdown().await;
}

#[tokio::test]
async fn send_flush_receive() {
    let server = backend().await;
    let service = running(&server).await;

    let mut conn = service.get_conn().await.expect("conn");
    conn.send(&[b"SET", b"a", b"1"]);
    conn.send(&[b"GET", b"a"]);
    conn.flush().await.expect("flush");
    assert_eq!(conn.receive().await.unwrap(), RespValue::Simple(b"OK".to_vec()));
    assert_eq!(conn.receive().await.unwrap(), RespValue::bulk("1"));
    drop(conn);

    server.shutdown().await;
}

#[tokio::test]
async fn publish_without_subscribers_reports_zero() {
    let server = backend().await;
    let service = running(&server).await;

    assert_eq!(service.publish("empty", &b"raw"[..]).await.unwrap(), 0);
    assert_eq!(
        service.publish_json("empty", &json!({ "n": 1 })).await.unwrap(),
        0
    );
    assert!(matches!(
        service.publish("", "x").await,
        Err(ServiceError::InvalidArgument(_))
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn stop_lands_in_stopped_when_close_fails() {
    let service = KVService::new();
    service
        .apply_configuration(Configuration::new(resetting_backend().await))
        .expect("apply configuration");
    service.start().await.expect("start");

    // Park one connection in the pool, then let the backend reset it so its
    // shutdown during close fails.
    let reply = service
        .run_with_conn(|conn| Box::pin(async move { conn.do_command(&[b"PING"]).await }))
        .await
        .expect("ping");
    assert_eq!(reply, RespValue::Simple(b"PONG".to_vec()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = service.stop().await.unwrap_err();
    assert!(matches!(err, ServiceError::Io(_)), "{:?}", err);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(matches!(service.get_conn().await, Err(ServiceError::NotRunning)));

    service.stop().await.expect("second stop is a no-op");
    service.start().await.expect("start after failed stop");
    assert!(service.is_running());
}
