//! Message envelope and payload contracts
//!
//! This module contains the data that flows through the broker:
//! - [`Message`] envelope with routing, priority and correlation metadata
//! - [`TypedPayload`] for binding a payload shape to a message type
//! - Domain payloads for the content pipeline and agent tasks

mod envelope;
mod payload;

pub use envelope::{
    CorrelationId, EnvelopeError, Message, MessageId, MessagePattern, MessageStatus, Priority,
    TenantId,
};
pub use payload::{
    AgentTask, ContentProcess, ContentSource, DigestReady, PayloadError, TypedPayload,
};
