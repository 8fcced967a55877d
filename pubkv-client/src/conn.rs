//! # Connection
//!
//! Purpose: One TCP connection to the backend speaking RESP2, split into a
//! read half and a write half so a session can hand them to different tasks.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Each half owns its buffer for the connection's life.
//! 2. **Bounded IO**: Optional read/write timeouts wrap every socket call.
//! 3. **Single Reader**: The read half is the only path that consumes
//!    replies, which keeps request/reply pairing trivial.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use pubkv_common::{decode, encode_command, RespValue};

use crate::error::{ServiceError, ServiceResult};

/// Socket options applied when dialing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Optional bound on each read.
    pub read_timeout: Option<Duration>,
    /// Optional bound on each write.
    pub write_timeout: Option<Duration>,
    /// Optional bound on the TCP connect.
    pub connect_timeout: Option<Duration>,
}

/// A dialed connection with reusable buffers.
pub struct Connection {
    reader: ConnReader,
    writer: ConnWriter,
}

impl Connection {
    /// Opens a TCP connection to `addr`.
    pub async fn dial(addr: &str, options: &DialOptions) -> ServiceResult<Self> {
        let stream = with_timeout(options.connect_timeout, "connect", TcpStream::connect(addr))
            .await
            .map_err(|source| ServiceError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Connection {
            reader: ConnReader {
                stream: read_half,
                buf: BytesMut::with_capacity(4 * 1024),
                timeout: options.read_timeout,
            },
            writer: ConnWriter {
                stream: write_half,
                buf: Vec::with_capacity(256),
                timeout: options.write_timeout,
            },
        })
    }

    /// Writes one command and reads its reply.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ServiceResult<RespValue> {
        self.writer.send(args).await?;
        self.reader.read_value().await
    }

    /// Buffers a command without writing it.
    pub fn queue(&mut self, args: &[&[u8]]) {
        self.writer.queue(args);
    }

    /// Writes every buffered command.
    pub async fn flush(&mut self) -> ServiceResult<()> {
        self.writer.flush().await
    }

    /// Reads the next reply.
    pub async fn receive(&mut self) -> ServiceResult<RespValue> {
        self.reader.read_value().await
    }

    /// Issues PING and checks the reply.
    pub async fn ping(&mut self) -> ServiceResult<()> {
        match self.exec(&[b"PING"]).await? {
            RespValue::Simple(_) | RespValue::Bulk(Some(_)) => Ok(()),
            RespValue::Error(message) => Err(ServiceError::server(&message)),
            _ => Err(ServiceError::UnexpectedResponse),
        }
    }

    /// Shuts down the write side, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> ServiceResult<()> {
        self.writer.shutdown().await
    }

    /// Hands out the two halves.
    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`Connection`].
pub struct ConnReader {
    stream: OwnedReadHalf,
    buf: BytesMut,
    timeout: Option<Duration>,
}

impl ConnReader {
    /// Reads one complete RESP value, waiting for more bytes as needed.
    pub async fn read_value(&mut self) -> ServiceResult<RespValue> {
        loop {
            if let Some(value) = decode(&mut self.buf)? {
                return Ok(value);
            }
            let read = with_timeout(self.timeout, "read", self.stream.read_buf(&mut self.buf)).await?;
            if read == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into());
            }
        }
    }
}

/// Write half of a [`Connection`].
pub struct ConnWriter {
    stream: OwnedWriteHalf,
    buf: Vec<u8>,
    timeout: Option<Duration>,
}

impl ConnWriter {
    /// Buffers a command without writing it.
    pub fn queue(&mut self, args: &[&[u8]]) {
        encode_command(args, &mut self.buf);
    }

    /// Buffers and writes a command.
    pub async fn send(&mut self, args: &[&[u8]]) -> ServiceResult<()> {
        self.queue(args);
        self.flush().await
    }

    /// Writes every buffered command.
    pub async fn flush(&mut self) -> ServiceResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let (stream, buf) = (&mut self.stream, &self.buf);
        let result = with_timeout(self.timeout, "write", async move {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await;
        // A failed write leaves the stream in an unknown state; never resend.
        self.buf.clear();
        Ok(result?)
    }

    /// Shuts down the write side.
    pub async fn shutdown(&mut self) -> ServiceResult<()> {
        Ok(with_timeout(self.timeout, "shutdown", self.stream.shutdown()).await?)
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    op: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", op, limit),
            )),
        },
        None => fut.await,
    }
}
