mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pubkv_client::{CancellationToken, KVService, Message, ServiceError};
use serde_json::json;

use common::{backend, configured, running, WAIT};

async fn wait_for_subscribers(service: &KVService, channel: &str, expected: i64) {
    tokio::time::timeout(WAIT, async {
        loop {
            if service.publish(channel, "ready").await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscribers ready");
}

#[tokio::test]
async fn publishes_from_subscribed_callback() {
    let server = backend().await;
    let service = running(&server).await;

    let cancel = CancellationToken::new();
    let publisher = service.clone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let stop = cancel.clone();

    let result = tokio::time::timeout(
        WAIT,
        service.subscribe(
            cancel.clone(),
            move || async move {
                publisher.publish("test-01", "hello").await?;
                anyhow::Ok(())
            },
            move |message: Message| {
                sink.lock().unwrap().push(message);
                stop.cancel();
                async { anyhow::Ok(()) }
            },
            &["test-01"],
        ),
    )
    .await
    .expect("session ended");

    assert!(result.is_ok(), "{:?}", result);
    let received = received.lock().unwrap();
    assert_eq!(
        received.first(),
        Some(&Message {
            channel: "test-01".to_string(),
            payload: Bytes::from_static(b"\"hello\""),
        })
    );

    server.shutdown().await;
}

#[tokio::test]
async fn raw_and_json_payloads_arrive_as_published() {
    let server = backend().await;
    let service = running(&server).await;

    let cancel = CancellationToken::new();
    let publisher = service.clone();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let stop = cancel.clone();

    let result = tokio::time::timeout(
        WAIT,
        service.subscribe(
            cancel.clone(),
            move || async move {
                publisher.publish("raw", &b"\x00\xffbinary"[..]).await?;
                publisher
                    .publish_json("json", &json!({ "id": 7, "ok": true }))
                    .await?;
                anyhow::Ok(())
            },
            move |message: Message| {
                let mut received = sink.lock().unwrap();
                received.push(message);
                if received.len() == 2 {
                    stop.cancel();
                }
                async { anyhow::Ok(()) }
            },
            &["raw", "json"],
        ),
    )
    .await
    .expect("session ended");

    assert!(result.is_ok(), "{:?}", result);
    let received = received.lock().unwrap();
    assert_eq!(received[0].channel, "raw");
    assert_eq!(&received[0].payload[..], b"\x00\xffbinary");
    assert_eq!(received[1].channel, "json");
    let decoded: serde_json::Value = serde_json::from_slice(&received[1].payload).unwrap();
    assert_eq!(decoded, json!({ "id": 7, "ok": true }));

    server.shutdown().await;
}

#[tokio::test]
async fn subscribed_callback_runs_once_before_messages() {
    let server = backend().await;
    let service = running(&server).await;

    let cancel = CancellationToken::new();
    let publisher = service.clone();
    let subscribed = Arc::new(AtomicUsize::new(0));
    let seen_subscribed = subscribed.clone();
    let ordered = Arc::new(AtomicBool::new(true));
    let order_flag = ordered.clone();
    let stop = cancel.clone();

    let result = tokio::time::timeout(
        WAIT,
        service.subscribe(
            cancel.clone(),
            move || async move {
                seen_subscribed.fetch_add(1, Ordering::SeqCst);
                publisher.publish("c", "x").await?;
                anyhow::Ok(())
            },
            {
                let subscribed = subscribed.clone();
                move |_message: Message| {
                    if subscribed.load(Ordering::SeqCst) != 1 {
                        order_flag.store(false, Ordering::SeqCst);
                    }
                    stop.cancel();
                    async { anyhow::Ok(()) }
                }
            },
            // Duplicates collapse, so the callback still fires exactly once.
            &["a", "b", "c", "a"],
        ),
    )
    .await
    .expect("session ended");

    assert!(result.is_ok(), "{:?}", result);
    assert_eq!(subscribed.load(Ordering::SeqCst), 1);
    assert!(ordered.load(Ordering::SeqCst));

    server.shutdown().await;
}

#[tokio::test]
async fn message_handler_error_ends_session() {
    let server = backend().await;
    let service = running(&server).await;
    let publisher = service.clone();

    let err = tokio::time::timeout(
        WAIT,
        service.subscribe(
            CancellationToken::new(),
            move || async move {
                publisher.publish("test-01", "hello").await?;
                anyhow::Ok(())
            },
            |_message: Message| async { Err::<(), _>(anyhow::anyhow!("something bad")) },
            &["test-01"],
        ),
    )
    .await
    .expect("session ended")
    .unwrap_err();

    assert!(matches!(err, ServiceError::Handler(_)));
    assert_eq!(err.to_string(), "something bad");

    server.shutdown().await;
}

#[tokio::test]
async fn subscribed_handler_error_ends_session() {
    let server = backend().await;
    let service = running(&server).await;

    let err = tokio::time::timeout(
        WAIT,
        service.subscribe(
            CancellationToken::new(),
            || async { Err::<(), _>(anyhow::anyhow!("not ready")) },
            |_message: Message| async { anyhow::Ok(()) },
            &["test-01"],
        ),
    )
    .await
    .expect("session ended")
    .unwrap_err();

    assert_eq!(err.to_string(), "not ready");

    server.shutdown().await;
}

#[tokio::test]
async fn cancel_before_messages_returns_ok() {
    let server = backend().await;
    let service = configured(&server);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    // Subscribing does not require the pool to be started.
    let result = tokio::time::timeout(
        WAIT,
        service.subscribe(
            cancel,
            move || async move {
                stop.cancel();
                anyhow::Ok(())
            },
            |_message: Message| async { anyhow::Ok(()) },
            &["quiet"],
        ),
    )
    .await
    .expect("session ended");

    assert!(result.is_ok(), "{:?}", result);

    server.shutdown().await;
}

#[tokio::test]
async fn rejects_bad_channel_lists() {
    let server = backend().await;
    let service = configured(&server);

    let err = service
        .subscribe(
            CancellationToken::new(),
            || async { anyhow::Ok(()) },
            |_message: Message| async { anyhow::Ok(()) },
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    let err = service
        .subscribe(
            CancellationToken::new(),
            || async { anyhow::Ok(()) },
            |_message: Message| async { anyhow::Ok(()) },
            &["ok", ""],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    server.shutdown().await;
}

#[tokio::test]
async fn subscribe_fails_when_backend_is_unreachable() {
    let server = backend().await;
    let service = configured(&server);
    server.shutdown().await;

    let err = tokio::time::timeout(
        WAIT,
        service.subscribe(
            CancellationToken::new(),
            || async { anyhow::Ok(()) },
            |_message: Message| async { anyhow::Ok(()) },
            &["news"],
        ),
    )
    .await
    .expect("session ended")
    .unwrap_err();
    assert!(matches!(err, ServiceError::Dial { .. }));
}

#[tokio::test]
async fn backend_shutdown_fails_active_session() {
    let server = backend().await;
    let service = running(&server).await;

    let session = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .subscribe(
                    CancellationToken::new(),
                    || async { anyhow::Ok(()) },
                    |_message: Message| async { anyhow::Ok(()) },
                    &["news"],
                )
                .await
        })
    };

    wait_for_subscribers(&service, "news", 1).await;
    server.shutdown().await;

    let result = tokio::time::timeout(WAIT, session)
        .await
        .expect("session ended")
        .expect("session task");
    assert!(result.is_err());
}

#[tokio::test]
async fn concurrent_sessions_receive_independently() {
    let server = backend().await;
    let service = running(&server).await;

    let mut sessions = Vec::new();
    let mut cancels = Vec::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let cancel = CancellationToken::new();
        cancels.push(cancel.clone());
        let service = service.clone();
        let delivered = delivered.clone();
        sessions.push(tokio::spawn(async move {
            service
                .subscribe(
                    cancel,
                    || async { anyhow::Ok(()) },
                    move |message: Message| {
                        if &message.payload[..] == b"\"fanout\"" {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }
                        async { anyhow::Ok(()) }
                    },
                    &["shared"],
                )
                .await
        }));
    }

    wait_for_subscribers(&service, "shared", 2).await;
    assert_eq!(service.publish("shared", "fanout").await.unwrap(), 2);

    tokio::time::timeout(WAIT, async {
        while delivered.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both sessions received");

    for cancel in cancels {
        cancel.cancel();
    }
    for session in sessions {
        let result = tokio::time::timeout(WAIT, session)
            .await
            .expect("session ended")
            .expect("session task");
        assert!(result.is_ok(), "{:?}", result);
    }

    server.shutdown().await;
}
