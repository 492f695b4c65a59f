//! Recovery layer: the outermost wrapper. Anything escaping it is a bug.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tracing::error;

use crate::errors::RequestError;

/// Runs `fut` under `catch_unwind`, turning a panic into a sanitized
/// internal-error result instead of propagating it (or aborting the task).
pub async fn guarded<F>(fut: F) -> Result<Value, RequestError>
where
    F: std::future::Future<Output = Result<Value, RequestError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            error!(panic = %message, "request handler panicked");
            Err(RequestError::Internal)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
