//! Pooled connection that counts every command it dispatches.

use std::sync::Arc;
use std::time::Instant;

use pubkv_common::RespValue;

use crate::error::ServiceResult;
use crate::metrics::{ServiceMetrics, DO_METHOD, SEND_METHOD};
use crate::pool::PooledConnection;

/// Decorates a [`PooledConnection`] with per-command accounting.
///
/// Dropping it returns the underlying connection to the pool.
pub struct InstrumentedConnection {
    conn: PooledConnection,
    metrics: Arc<ServiceMetrics>,
}

impl InstrumentedConnection {
    pub(crate) fn new(conn: PooledConnection, metrics: Arc<ServiceMetrics>) -> Self {
        InstrumentedConnection { conn, metrics }
    }

    /// Executes one command and waits for its reply.
    pub async fn do_command(&mut self, args: &[&[u8]]) -> ServiceResult<RespValue> {
        let command = command_name(args);
        self.metrics.command_call(DO_METHOD, &command);
        let started = Instant::now();
        let result = self.conn.exec(args).await;
        self.metrics
            .command_duration(DO_METHOD, &command, started.elapsed());
        result
    }

    /// Buffers a command; the reply is read later with [`receive`](Self::receive).
    pub fn send(&mut self, args: &[&[u8]]) {
        self.metrics.command_call(SEND_METHOD, &command_name(args));
        self.conn.queue(args);
    }

    /// Writes buffered commands.
    pub async fn flush(&mut self) -> ServiceResult<()> {
        self.conn.flush().await
    }

    /// Reads the next pending reply.
    pub async fn receive(&mut self) -> ServiceResult<RespValue> {
        self.conn.receive().await
    }
}

fn command_name(args: &[&[u8]]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
        .unwrap_or_default()
}
