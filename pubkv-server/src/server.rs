//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the keyspace
//! or the channel broker.
//!
//! Each connection has a reader loop and a writer task joined by an unbounded
//! queue, so broker fan-out never waits on a slow socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pubkv_common::{decode, encode_value, RespValue};

use crate::broker::{Broker, ConnId, Outbound};

/// Shared state behind every connection.
#[derive(Default)]
struct Shared {
    keyspace: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    broker: Broker,
    next_conn: AtomicU64,
}

/// Running server; dropping it does not stop the accept loop, `shutdown` does.
pub struct ServerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and closes every open connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept.await;
    }
}

/// Binds `addr` and serves connections on the current runtime.
pub async fn spawn(addr: &str) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let accept = tokio::spawn(accept_loop(listener, Arc::new(Shared::default()), cancel.clone()));
    info!(%addr, "server listening");
    Ok(ServerHandle { addr, cancel, accept })
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, shared, cancel).await {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
    info!("server stopped");
}

/// Handles a single TCP client connection.
async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut reader, writer) = stream.into_split();
    let (outbound, queued) = unbounded_channel();
    let writer = tokio::spawn(write_loop(writer, queued, cancel.clone()));

    let result = read_loop(&mut reader, conn, &shared, &outbound, &cancel).await;

    shared.broker.remove(conn);
    drop(outbound);
    let _ = writer.await;
    result
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    conn: ConnId,
    shared: &Shared,
    outbound: &Outbound,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match decode(&mut buffer) {
                Ok(Some(frame)) => {
                    let Some(args) = frame.into_args() else {
                        send(outbound, &error("expected array of bulk strings"));
                        continue;
                    };
                    dispatch_command(&args, conn, shared, outbound);
                }
                Ok(None) => break,
                Err(err) => {
                    send(outbound, &error(&err.to_string()));
                    return Ok(());
                }
            }
        }

        let read = tokio::select! {
            read = reader.read_buf(&mut buffer) => read?,
            _ = cancel.cancelled() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queued: UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        let frame = tokio::select! {
            frame = queued.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await
}

fn dispatch_command(args: &[Vec<u8>], conn: ConnId, shared: &Shared, outbound: &Outbound) {
    let Some(cmd) = args.first() else {
        send(outbound, &error("empty command"));
        return;
    };

    // Subscribed connections only accept the pub/sub subset.
    if shared.broker.subscription_count(conn) > 0 {
        if cmd.eq_ignore_ascii_case(b"SUBSCRIBE") {
            handle_subscribe(args, conn, shared, outbound);
        } else if cmd.eq_ignore_ascii_case(b"UNSUBSCRIBE") {
            shared.broker.unsubscribe(conn, outbound, &args[1..]);
        } else if cmd.eq_ignore_ascii_case(b"PING") {
            let payload = args.get(1).cloned().unwrap_or_default();
            send(
                outbound,
                &RespValue::Array(vec![RespValue::bulk("pong"), RespValue::bulk(payload)]),
            );
        } else {
            send(outbound, &error("only SUBSCRIBE / UNSUBSCRIBE / PING allowed in this context"));
        }
        return;
    }

    let reply = if cmd.eq_ignore_ascii_case(b"PING") {
        handle_ping(args)
    } else if cmd.eq_ignore_ascii_case(b"ECHO") {
        handle_echo(args)
    } else if cmd.eq_ignore_ascii_case(b"GET") {
        handle_get(args, shared)
    } else if cmd.eq_ignore_ascii_case(b"SET") {
        handle_set(args, shared)
    } else if cmd.eq_ignore_ascii_case(b"DEL") {
        handle_del(args, shared)
    } else if cmd.eq_ignore_ascii_case(b"PUBLISH") {
        handle_publish(args, shared)
    } else if cmd.eq_ignore_ascii_case(b"SUBSCRIBE") {
        handle_subscribe(args, conn, shared, outbound);
        return;
    } else if cmd.eq_ignore_ascii_case(b"UNSUBSCRIBE") {
        shared.broker.unsubscribe(conn, outbound, &args[1..]);
        return;
    } else {
        error("unknown command")
    };
    send(outbound, &reply);
}

fn handle_ping(args: &[Vec<u8>]) -> RespValue {
    match args.len() {
        1 => RespValue::Simple(b"PONG".to_vec()),
        2 => RespValue::bulk(args[1].clone()),
        _ => error("wrong number of arguments for PING"),
    }
}

fn handle_echo(args: &[Vec<u8>]) -> RespValue {
    match args {
        [_, message] => RespValue::bulk(message.clone()),
        _ => error("wrong number of arguments for ECHO"),
    }
}

fn handle_get(args: &[Vec<u8>], shared: &Shared) -> RespValue {
    let [_, key] = args else {
        return error("wrong number of arguments for GET");
    };
    let keyspace = shared.keyspace.lock().expect("keyspace mutex poisoned");
    RespValue::Bulk(keyspace.get(key).cloned())
}

fn handle_set(args: &[Vec<u8>], shared: &Shared) -> RespValue {
    let [_, key, value] = args else {
        return error("wrong number of arguments for SET");
    };
    shared
        .keyspace
        .lock()
        .expect("keyspace mutex poisoned")
        .insert(key.clone(), value.clone());
    RespValue::Simple(b"OK".to_vec())
}

fn handle_del(args: &[Vec<u8>], shared: &Shared) -> RespValue {
    if args.len() < 2 {
        return error("wrong number of arguments for DEL");
    }
    let mut keyspace = shared.keyspace.lock().expect("keyspace mutex poisoned");
    let removed = args[1..]
        .iter()
        .filter(|key| keyspace.remove(key.as_slice()).is_some())
        .count();
    RespValue::Integer(removed as i64)
}

fn handle_publish(args: &[Vec<u8>], shared: &Shared) -> RespValue {
    let [_, channel, payload] = args else {
        return error("wrong number of arguments for PUBLISH");
    };
    RespValue::Integer(shared.broker.publish(channel, payload) as i64)
}

fn handle_subscribe(args: &[Vec<u8>], conn: ConnId, shared: &Shared, outbound: &Outbound) {
    if args.len() < 2 {
        send(outbound, &error("wrong number of arguments for SUBSCRIBE"));
        return;
    }
    shared.broker.subscribe(conn, outbound, &args[1..]);
}

fn send(outbound: &Outbound, value: &RespValue) {
    let mut frame = Vec::new();
    encode_value(value, &mut frame);
    let _ = outbound.send(frame);
}

fn error(message: &str) -> RespValue {
    RespValue::Error(format!("ERR {}", message).into_bytes())
}
