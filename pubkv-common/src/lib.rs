// pubkv-common - Shared protocol and metrics definitions for PubKV
//
// This crate holds the RESP2 codec used by both the client and the test
// broker, plus the metrics collaborator interface.

pub mod metrics;
pub mod resp;

// Re-export for convenience
pub use metrics::*;
pub use resp::*;
