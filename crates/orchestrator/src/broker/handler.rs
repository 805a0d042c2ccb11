//! Handler contract and closure adapters

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, PayloadError, TypedPayload};

/// Error returned by a message handler
///
/// The broker does not distinguish transient from permanent failures;
/// every error consumes one attempt of the delivery budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::new(format!("handler timed out after {}ms", after.as_millis())).with_type("timeout")
    }

    pub(crate) fn panicked() -> Self {
        Self::new("handler panicked").with_type("panic")
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<PayloadError> for HandlerError {
    fn from(err: PayloadError) -> Self {
        Self::new(err.to_string()).with_type("payload")
    }
}

/// Result of one handler invocation; `Ok` carries the reply payload
pub type HandlerResult = Result<Value, HandlerError>;

/// A subscriber to one (type, pattern) pair
///
/// Handlers must tolerate redelivery: after a crash the broker replays
/// every message that was not acknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self.f)(message.clone()).await
    }
}

/// Adapter decoding a [`TypedPayload`] before calling the closure
pub struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

impl<P, F> TypedHandler<P, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P, F, Fut> MessageHandler for TypedHandler<P, F>
where
    P: TypedPayload,
    F: Fn(P, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        let payload = message.decode::<P>()?;
        (self.f)(payload, message.clone()).await
    }
}
