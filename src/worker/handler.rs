//! Work functions.

use std::future::Future;

use futures::future::BoxFuture;

/// Error returned by a work function. Anything convertible into a boxed
/// error works with `?`, including `anyhow::Error` and string messages.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

/// The user-supplied unit of work: takes a job payload, yields a result.
///
/// Implemented for every `Fn(Value) -> impl Future<Output = HandlerResult>`.
/// The returned future is spawned onto the runtime, so it must be `'static`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, payload: serde_json::Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: serde_json::Value) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(payload))
    }
}
