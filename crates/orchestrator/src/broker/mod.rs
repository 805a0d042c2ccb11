//! Message broker
//!
//! This module contains the routing side of the orchestrator:
//! - [`MessageBroker`] for publish, subscribe and request/response
//! - [`HandlerRegistry`] mapping (type, pattern) to subscribers
//! - [`CorrelationTracker`] matching replies to waiting requesters
//! - [`DeadLetterQueue`] for inspecting messages that exhausted retries

mod correlation;
mod dead_letter;
mod dispatch;
mod handler;
mod lane;
mod message_broker;
mod registry;

pub use correlation::{CorrelationTracker, DuplicateCorrelation};
pub use dead_letter::{DeadLetterMessage, DeadLetterQueue};
pub use dispatch::DeliveryState;
pub use handler::{FnHandler, HandlerError, HandlerResult, MessageHandler, TypedHandler};
pub use message_broker::{BrokerError, BrokerStats, MessageBroker};
pub use registry::{
    HandlerRegistry, RegistryError, SubscribeOptions, Subscription, SubscriptionId,
};
