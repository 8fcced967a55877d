//! # Publish/Subscribe Session
//!
//! Purpose: Run one supervised subscription on a dedicated connection until
//! the caller cancels it, a callback fails, or the connection dies.
//!
//! ## Design Principles
//! 1. **Single Reader**: Only the spawned receive task reads from the session
//!    connection; the supervising loop only writes (PING, UNSUBSCRIBE).
//! 2. **One Terminal Result**: The receive task's `JoinHandle` is the
//!    completion slot, produced once and awaited once.
//! 3. **Contained Callbacks**: Callback errors and panics become the
//!    session result; they never unwind past the session.
//!
//! ## Lifecycle
//!
//! ```text
//! Dialing -> Subscribing -> Active -> Draining -> Closed
//!    |            |
//!    +------------+--> Failed
//! ```
//!
//! ## Notes
//! - Cancellation is observed only between waits of the supervising loop. A
//!   callback that never returns holds the session open.
//! - A failed health-check PING and a receive error can race. Whichever the
//!   supervising loop observes first is returned; no further ordering is
//!   imposed. After a failed PING the session still drains, and an error the
//!   receive task reports while draining is logged and then dropped in favor
//!   of the PING error.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pubkv_common::RespValue;

use crate::config::PubSubConfiguration;
use crate::conn::{ConnReader, Connection, DialOptions};
use crate::error::{HandlerResult, ServiceError, ServiceResult};
use crate::metrics::{ServiceMetrics, SUBSCRIBE_METHOD};
use crate::recovery::{guard_callback, recovered_panic};
use crate::service::KVService;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Bytes,
}

/// Stages of a subscribe session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Subscribing,
    Active,
    Draining,
    Closed,
    Failed,
}

impl KVService {
    /// Subscribes to `channels` and blocks until the session ends.
    ///
    /// `on_subscribed` runs once, after every requested channel is confirmed
    /// and before any message for this session is delivered. `on_message`
    /// runs for every message. Cancelling `cancel` unsubscribes and returns
    /// `Ok(())` once the server confirms. An error or panic from either
    /// callback ends the session with that error.
    ///
    /// The session uses its own connection and does not need the service to
    /// be started.
    pub async fn subscribe<S, SF, M, MF>(
        &self,
        cancel: CancellationToken,
        on_subscribed: S,
        on_message: M,
        channels: &[&str],
    ) -> ServiceResult<()>
    where
        S: FnOnce() -> SF + Send + 'static,
        SF: std::future::Future<Output = HandlerResult> + Send + 'static,
        M: FnMut(Message) -> MF + Send + 'static,
        MF: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let metrics = self.metrics_handle();
        metrics.method_call(SUBSCRIBE_METHOD);

        let channels = distinct_channels(channels)?;
        let configuration = self.configuration().with_defaults();
        configuration.validate()?;

        let session = PubSubSession {
            config: configuration.pubsub,
            channels,
            metrics,
            state: SessionState::Dialing,
        };
        session
            .run(&configuration.address, cancel, on_subscribed, on_message)
            .await
    }
}

struct PubSubSession {
    config: PubSubConfiguration,
    channels: Vec<String>,
    metrics: Arc<ServiceMetrics>,
    state: SessionState,
}

impl PubSubSession {
    async fn run<S, SF, M, MF>(
        mut self,
        addr: &str,
        cancel: CancellationToken,
        on_subscribed: S,
        on_message: M,
    ) -> ServiceResult<()>
    where
        S: FnOnce() -> SF + Send + 'static,
        SF: std::future::Future<Output = HandlerResult> + Send + 'static,
        M: FnMut(Message) -> MF + Send + 'static,
        MF: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let options = DialOptions {
            read_timeout: Some(self.config.read_timeout),
            write_timeout: Some(self.config.write_timeout),
            connect_timeout: None,
        };
        let conn = match Connection::dial(addr, &options).await {
            Ok(conn) => conn,
            Err(err) => return self.fail(err),
        };
        let (reader, mut writer) = conn.into_split();

        self.transition(SessionState::Subscribing);
        let mut args: Vec<&[u8]> = Vec::with_capacity(self.channels.len() + 1);
        args.push(b"SUBSCRIBE");
        args.extend(self.channels.iter().map(|channel| channel.as_bytes()));
        if let Err(err) = writer.send(&args).await {
            return self.fail(err);
        }

        self.transition(SessionState::Active);
        let active = ActiveSubscription::open(self.metrics.clone());
        let mut completion = tokio::spawn(
            ReceiveTask {
                reader,
                expected: self.channels.len() as i64,
                on_subscribed: Some(on_subscribed),
                on_message,
                metrics: self.metrics.clone(),
            }
            .run(),
        );
        let _abort = AbortOnDrop(completion.abort_handle());

        let period = self.config.health_check_interval;
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ping_failure = loop {
            tokio::select! {
                joined = &mut completion => {
                    drop(active);
                    self.transition(SessionState::Closed);
                    return flatten(joined);
                }
                _ = health.tick() => {
                    let result = writer.send(&[b"PING"]).await;
                    self.metrics.subscribe_outcome(&result);
                    if let Err(err) = result {
                        warn!(error = %err, "pubsub health check failed");
                        break Some(err);
                    }
                }
                _ = cancel.cancelled() => break None,
            }
        };

        drop(active);
        self.transition(SessionState::Draining);
        if let Err(err) = writer.send(&[b"UNSUBSCRIBE"]).await {
            debug!(error = %err, "unsubscribe write failed; waiting for receive task");
        }
        let drained = flatten(completion.await);
        self.transition(SessionState::Closed);

        match ping_failure {
            Some(err) => {
                if let Err(dropped) = drained {
                    warn!(error = %dropped, "receive error superseded by health check failure");
                }
                Err(err)
            }
            None => drained,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, channels = ?self.channels, "pubsub session");
        self.state = next;
    }

    fn fail(mut self, err: ServiceError) -> ServiceResult<()> {
        warn!(error = %err, state = ?self.state, "pubsub session failed");
        self.transition(SessionState::Failed);
        Err(err)
    }
}

/// Keeps the active-subscriptions gauge raised while alive.
struct ActiveSubscription(Arc<ServiceMetrics>);

impl ActiveSubscription {
    fn open(metrics: Arc<ServiceMetrics>) -> Self {
        metrics.subscription_opened();
        ActiveSubscription(metrics)
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.0.subscription_closed();
    }
}

/// Aborts the receive task if the session future is dropped early.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ReceiveTask<S, M> {
    reader: ConnReader,
    expected: i64,
    on_subscribed: Option<S>,
    on_message: M,
    metrics: Arc<ServiceMetrics>,
}

impl<S, SF, M, MF> ReceiveTask<S, M>
where
    S: FnOnce() -> SF + Send + 'static,
    SF: std::future::Future<Output = HandlerResult> + Send + 'static,
    M: FnMut(Message) -> MF + Send + 'static,
    MF: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(mut self) -> ServiceResult<()> {
        loop {
            let push = self.reader.read_value().await.and_then(classify);
            let push = match push {
                Ok(push) => push,
                Err(err) => {
                    let result = Err(err);
                    self.metrics.subscribe_outcome(&result);
                    return result;
                }
            };

            match push {
                Push::Pong => {}
                Push::Message(message) => {
                    let on_message = &mut self.on_message;
                    let result = guard_callback(async move { on_message(message).await }).await;
                    self.metrics.subscribe_outcome(&result);
                    if let Err(err) = result {
                        warn!(error = %err, "message handler failed");
                        return Err(err);
                    }
                }
                Push::Subscription { count } if count == self.expected => {
                    if let Some(on_subscribed) = self.on_subscribed.take() {
                        let result = guard_callback(async move { on_subscribed().await }).await;
                        self.metrics.subscribe_outcome(&result);
                        if let Err(err) = result {
                            warn!(error = %err, "subscribed handler failed");
                            return Err(err);
                        }
                    }
                }
                // Zero confirmed channels means a prior UNSUBSCRIBE completed.
                Push::Subscription { count: 0 } => return Ok(()),
                Push::Subscription { .. } => {}
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Push {
    Message(Message),
    Subscription { count: i64 },
    Pong,
}

fn classify(value: RespValue) -> ServiceResult<Push> {
    let items = match value {
        RespValue::Array(items) => items,
        RespValue::Simple(text) if text.eq_ignore_ascii_case(b"PONG") => return Ok(Push::Pong),
        RespValue::Error(message) => return Err(ServiceError::server(&message)),
        other => {
            return Err(ServiceError::Protocol(format!(
                "unexpected reply on subscription: {:?}",
                other
            )))
        }
    };

    let mut parts = items.into_iter();
    let kind = parts
        .next()
        .and_then(into_bytes)
        .ok_or_else(|| ServiceError::Protocol("push without kind".to_string()))?;

    match kind.to_ascii_lowercase().as_slice() {
        b"message" => match (parts.next().and_then(into_bytes), parts.next().and_then(into_bytes)) {
            (Some(channel), Some(payload)) => Ok(Push::Message(Message {
                channel: String::from_utf8_lossy(&channel).into_owned(),
                payload: Bytes::from(payload),
            })),
            _ => Err(ServiceError::Protocol("malformed message push".to_string())),
        },
        b"subscribe" | b"unsubscribe" => match parts.nth(1) {
            Some(RespValue::Integer(count)) => Ok(Push::Subscription { count }),
            _ => Err(ServiceError::Protocol("malformed subscription push".to_string())),
        },
        b"pong" => Ok(Push::Pong),
        other => Err(ServiceError::Protocol(format!(
            "unexpected push kind {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn into_bytes(value: RespValue) -> Option<Vec<u8>> {
    match value {
        RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
        _ => None,
    }
}

fn flatten(joined: Result<ServiceResult<()>, JoinError>) -> ServiceResult<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(recovered_panic(err.into_panic())),
        Err(err) => Err(ServiceError::Protocol(format!("receive task stopped: {}", err))),
    }
}

fn distinct_channels(channels: &[&str]) -> ServiceResult<Vec<String>> {
    if channels.is_empty() {
        return Err(ServiceError::InvalidArgument("at least one channel is required"));
    }
    let mut distinct: Vec<String> = Vec::with_capacity(channels.len());
    for channel in channels {
        if channel.is_empty() {
            return Err(ServiceError::InvalidArgument("channel name must not be empty"));
        }
        if !distinct.iter().any(|known| known == channel) {
            distinct.push(channel.to_string());
        }
    }
    Ok(distinct)
}
