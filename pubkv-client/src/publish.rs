//! PUBLISH with raw or JSON-encoded payloads.

use bytes::Bytes;
use serde::Serialize;

use pubkv_common::RespValue;

use crate::error::{ServiceError, ServiceResult};
use crate::metrics::PUBLISH_METHOD;
use crate::service::KVService;

/// Message body accepted by [`KVService::publish`].
///
/// Raw bytes go on the wire untouched; everything else is carried as its JSON
/// encoding, so publishing the string `hello` delivers `"hello"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    /// Already-encoded JSON, produced straight from the value so field order
    /// and number formatting are those of its `Serialize` impl.
    Json(Bytes),
}

impl Payload {
    /// Encodes any serializable value as a JSON payload.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> ServiceResult<Self> {
        Ok(Payload::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Bytes that will be written as the PUBLISH message argument.
    pub fn encode(&self) -> &[u8] {
        match self {
            Payload::Raw(data) | Payload::Json(data) => data,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Raw(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(data))
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Raw(Bytes::copy_from_slice(data))
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(data: &[u8; N]) -> Self {
        Payload::Raw(Bytes::copy_from_slice(data))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::from(serde_json::Value::String(text.to_string()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::from(serde_json::Value::String(text))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(Bytes::from(value.to_string()))
    }
}

impl KVService {
    /// Sends `payload` to `channel` over a pooled connection.
    ///
    /// Returns the number of subscribers that received the message.
    pub async fn publish(&self, channel: &str, payload: impl Into<Payload>) -> ServiceResult<i64> {
        if channel.is_empty() {
            return Err(ServiceError::InvalidArgument("channel name must not be empty"));
        }
        let metrics = self.metrics_handle();
        metrics.method_call(PUBLISH_METHOD);

        let channel = channel.to_string();
        let payload = payload.into();
        self.run_with_conn(move |conn| {
            Box::pin(async move {
                let message = payload.encode();
                metrics.publish_traffic(message.len());

                match conn
                    .do_command(&[b"PUBLISH", channel.as_bytes(), message])
                    .await?
                {
                    RespValue::Integer(receivers) => Ok(receivers),
                    RespValue::Error(reply) => Err(ServiceError::server(&reply)),
                    _ => Err(ServiceError::UnexpectedResponse),
                }
            })
        })
        .await
    }

    /// Serializes `value` to JSON and publishes it.
    ///
    /// A serialization failure aborts before anything is sent.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        value: &T,
    ) -> ServiceResult<i64> {
        let payload = Payload::value(value)?;
        self.publish(channel, payload).await
    }
}
