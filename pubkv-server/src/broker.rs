//! # Channel Broker
//!
//! Purpose: Track which connections listen on which channels and fan published
//! messages out to them.
//!
//! ## Notes
//! - Frames are queued on each connection's outbound channel while the broker
//!   lock is held, so a subscriber sees its confirmations before any message
//!   published after them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use pubkv_common::{encode_value, RespValue};

/// Connection identifier assigned by the server.
pub type ConnId = u64;

/// Encoded frames waiting to be written to one connection.
pub type Outbound = UnboundedSender<Vec<u8>>;

#[derive(Default)]
struct BrokerState {
    channels: HashMap<Vec<u8>, HashMap<ConnId, Outbound>>,
    memberships: HashMap<ConnId, BTreeSet<Vec<u8>>>,
}

/// In-memory pub/sub registry.
#[derive(Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to every channel and queues one confirmation per channel.
    pub fn subscribe(&self, conn: ConnId, outbound: &Outbound, channels: &[Vec<u8>]) {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        for channel in channels {
            state
                .channels
                .entry(channel.clone())
                .or_default()
                .insert(conn, outbound.clone());
            let joined = state.memberships.entry(conn).or_default();
            joined.insert(channel.clone());
            let count = joined.len() as i64;
            let _ = outbound.send(push("subscribe", Some(channel), count));
        }
    }

    /// Removes `conn` from `channels`, or from all of its channels when empty.
    pub fn unsubscribe(&self, conn: ConnId, outbound: &Outbound, channels: &[Vec<u8>]) {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let targets: Vec<Vec<u8>> = if channels.is_empty() {
            state
                .memberships
                .get(&conn)
                .map(|joined| joined.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            channels.to_vec()
        };

        if targets.is_empty() {
            let _ = outbound.send(push("unsubscribe", None, 0));
            return;
        }

        for channel in &targets {
            if let Some(listeners) = state.channels.get_mut(channel) {
                listeners.remove(&conn);
                if listeners.is_empty() {
                    state.channels.remove(channel);
                }
            }
            let remaining = match state.memberships.get_mut(&conn) {
                Some(joined) => {
                    joined.remove(channel);
                    joined.len() as i64
                }
                None => 0,
            };
            let _ = outbound.send(push("unsubscribe", Some(channel), remaining));
        }
        if state.memberships.get(&conn).is_some_and(BTreeSet::is_empty) {
            state.memberships.remove(&conn);
        }
    }

    /// Queues `payload` for every listener of `channel`; returns how many.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        let state = self.state.lock().expect("broker mutex poisoned");
        let Some(listeners) = state.channels.get(channel) else {
            return 0;
        };
        let mut frame = Vec::with_capacity(payload.len() + channel.len() + 32);
        encode_value(
            &RespValue::Array(vec![
                RespValue::bulk("message"),
                RespValue::bulk(channel),
                RespValue::bulk(payload),
            ]),
            &mut frame,
        );
        listeners
            .values()
            .filter(|outbound| outbound.send(frame.clone()).is_ok())
            .count()
    }

    /// Number of channels `conn` is subscribed to.
    pub fn subscription_count(&self, conn: ConnId) -> usize {
        let state = self.state.lock().expect("broker mutex poisoned");
        state.memberships.get(&conn).map_or(0, BTreeSet::len)
    }

    /// Drops every subscription held by a closed connection.
    pub fn remove(&self, conn: ConnId) {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let Some(joined) = state.memberships.remove(&conn) else {
            return;
        };
        for channel in joined {
            if let Some(listeners) = state.channels.get_mut(&channel) {
                listeners.remove(&conn);
                if listeners.is_empty() {
                    state.channels.remove(&channel);
                }
            }
        }
    }
}

fn push(kind: &str, channel: Option<&Vec<u8>>, count: i64) -> Vec<u8> {
    let mut frame = Vec::new();
    encode_value(
        &RespValue::Array(vec![
            RespValue::bulk(kind),
            RespValue::Bulk(channel.cloned()),
            RespValue::Integer(count),
        ]),
        &mut frame,
    );
    frame
}
