//! Runs caller callbacks with panics turned into errors.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::error::{HandlerResult, ServiceError, ServiceResult};

/// Message used when a panic payload is neither `&str` nor `String`.
pub const UNMAPPED_PANIC: &str = "unmapped panic type";

/// Awaits a callback future, mapping its error or panic into `ServiceError`.
///
/// The future is built inside the guarded region by the caller (see the
/// `async move` blocks at the call sites) so a panic while constructing it is
/// caught too.
pub(crate) async fn guard_callback<F>(callback: F) -> ServiceResult<()>
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ServiceError::Handler(err)),
        Err(payload) => Err(recovered_panic(payload)),
    }
}

/// Converts a panic payload into `ServiceError::RecoveredPanic`.
pub(crate) fn recovered_panic(payload: Box<dyn Any + Send>) -> ServiceError {
    let message = match payload.downcast::<String>() {
        Ok(text) => *text,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(text) => text.to_string(),
            None => UNMAPPED_PANIC.to_string(),
        },
    };
    ServiceError::RecoveredPanic(message)
}
