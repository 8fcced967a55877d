use thiserror::Error;

use pubkv_common::RespError;

/// Result type for the client.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result returned by caller-supplied subscription callbacks.
pub type HandlerResult = anyhow::Result<()>;

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration input had the wrong shape.
    #[error("wrong configuration informed: {0}")]
    WrongConfiguration(#[source] serde_json::Error),

    /// Configuration values violate an invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A pool-backed operation was attempted while the service is stopped.
    #[error("service not running")]
    NotRunning,

    /// Opening a TCP connection failed.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing error or a push the session does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Pool is at its active limit and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Caller passed an argument the operation cannot use.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Payload could not be encoded as JSON.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error returned by a subscription callback, displayed verbatim.
    #[error("{0}")]
    Handler(anyhow::Error),

    /// A subscription callback panicked.
    #[error("{0}")]
    RecoveredPanic(String),
}

impl ServiceError {
    pub(crate) fn server(message: &[u8]) -> Self {
        ServiceError::Server(String::from_utf8_lossy(message).into_owned())
    }
}

impl From<RespError> for ServiceError {
    fn from(err: RespError) -> Self {
        ServiceError::Protocol(err.to_string())
    }
}
