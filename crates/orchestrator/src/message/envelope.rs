//! Message envelope and its lifecycle enums

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique message identity (UUID v7, time ordered)
pub type MessageId = Uuid;

/// Identifier linking a request to its reply
pub type CorrelationId = Uuid;

/// Tenant isolation boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Delivery semantics of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePattern {
    /// Fan-out to every subscriber, no reply expected
    PublishSubscribe,
    /// Exactly one handler, correlated reply expected
    RequestResponse,
    /// Exactly one designated handler
    Command,
    /// Broadcast notification
    Event,
}

impl MessagePattern {
    /// Whether more than one handler may subscribe to a type with this pattern
    pub fn allows_fan_out(&self) -> bool {
        matches!(self, Self::PublishSubscribe | Self::Event)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublishSubscribe => "publish_subscribe",
            Self::RequestResponse => "request_response",
            Self::Command => "command",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for MessagePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessagePattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish_subscribe" => Ok(Self::PublishSubscribe),
            "request_response" => Ok(Self::RequestResponse),
            "command" => Ok(Self::Command),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown message pattern: {other}")),
        }
    }
}

/// Dispatch priority within a lane (declaration order is ascending priority)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Message lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Durably written, not yet handed to a handler
    #[default]
    Pending,
    /// Handed to its handler(s)
    Dispatched,
    /// Every handler returned normally
    Acknowledged,
    /// Last attempt failed, a retry is scheduled
    Failed,
    /// Retry budget exhausted, moved to the dead letter store
    DeadLettered,
}

impl MessageStatus {
    /// Terminal statuses are never redelivered, not even by recovery
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Envelope rule violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message type must not be empty")]
    EmptyType,

    #[error("request-response message {0} has no correlation id")]
    MissingCorrelation(MessageId),

    #[error("{pattern} message {id} must not carry a correlation id")]
    UnexpectedCorrelation { id: MessageId, pattern: MessagePattern },
}

/// Immutable message envelope
///
/// Everything except `status` and `attempt_count` is fixed at creation;
/// those two are lifecycle bookkeeping owned by the broker. All fields
/// serialize losslessly so the substrate can replay exactly this structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    /// Routing key, e.g. `content.process`
    #[serde(rename = "type")]
    pub message_type: String,

    pub pattern: MessagePattern,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub status: MessageStatus,

    /// Handler-defined structured data
    pub payload: serde_json::Value,

    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,

    /// Message that triggered this one
    #[serde(default)]
    pub causation_id: Option<MessageId>,

    #[serde(default)]
    pub tenant_id: TenantId,

    /// Narrows FIFO ordering below the routing key (e.g. one workflow)
    #[serde(default)]
    pub ordering_key: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub attempt_count: u32,
}

impl Message {
    /// Create a pending message with a fresh id
    pub fn new(
        message_type: impl Into<String>,
        pattern: MessagePattern,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_type: message_type.into(),
            pattern,
            priority: Priority::Normal,
            status: MessageStatus::Pending,
            payload,
            correlation_id: None,
            causation_id: None,
            tenant_id: TenantId::default(),
            ordering_key: None,
            created_at: Utc::now(),
            attempt_count: 0,
        }
    }

    /// Shorthand for an event message
    pub fn event(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(message_type, MessagePattern::Event, payload)
    }

    /// Shorthand for a command message
    pub fn command(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(message_type, MessagePattern::Command, payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Mark this message as caused by `parent`, inheriting its tenant
    pub fn caused_by(mut self, parent: &Message) -> Self {
        self.causation_id = Some(parent.id);
        self.tenant_id = parent.tenant_id.clone();
        self
    }

    /// Build the reply for a request-response message
    pub fn reply_to(request: &Message, payload: serde_json::Value) -> Self {
        let mut reply = Self::new(
            format!("{}.reply", request.message_type),
            MessagePattern::RequestResponse,
            payload,
        )
        .caused_by(request);
        reply.correlation_id = request.correlation_id;
        reply.priority = request.priority;
        reply
    }

    /// Key of the FIFO lane this message is dispatched on
    pub fn lane_key(&self) -> String {
        match &self.ordering_key {
            Some(key) => format!("{}#{}", self.message_type, key),
            None => self.message_type.clone(),
        }
    }

    /// Fill in identity and timestamp when the caller left them blank
    pub(crate) fn normalize(&mut self) {
        if self.id.is_nil() {
            self.id = Uuid::now_v7();
            self.created_at = Utc::now();
        }
    }

    /// Check the correlation invariant for this message's pattern
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.message_type.trim().is_empty() {
            return Err(EnvelopeError::EmptyType);
        }

        match self.pattern {
            MessagePattern::RequestResponse if self.correlation_id.is_none() => {
                Err(EnvelopeError::MissingCorrelation(self.id))
            }
            MessagePattern::Event | MessagePattern::Command if self.correlation_id.is_some() => {
                Err(EnvelopeError::UnexpectedCorrelation {
                    id: self.id,
                    pattern: self.pattern,
                })
            }
            _ => Ok(()),
        }
    }
}
