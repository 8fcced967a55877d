//! # PubKV Test Backend
//!
//! Purpose: A small Redis-compatible server speaking the subset the client
//! needs (keyspace commands plus channel pub/sub), used by integration tests
//! and for local experiments.
//!
//! ## Design Principles
//! 1. **Protocol Clarity**: Reuse the shared RESP2 codec for both directions.
//! 2. **Ordered Fan-out**: Pushes for one connection go through a single queue.
//! 3. **Clean Shutdown**: One cancellation token stops the listener and every
//!    connection it accepted.

pub mod broker;
pub mod server;

pub use broker::Broker;
pub use server::{spawn, ServerHandle};
