//! Typed payloads keyed by message type
//!
//! On the wire a payload is plain JSON. In code, each message type declares
//! its concrete shape by implementing [`TypedPayload`]; decoding checks the
//! envelope's type tag before touching the JSON, so a handler never sees a
//! payload meant for a different type.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Message, MessagePattern};

/// Errors from encoding or decoding payloads
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Envelope type does not match the requested payload type
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    /// JSON did not match the declared shape
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// Value could not be turned into JSON
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A payload shape bound to one message type
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use switchyard_orchestrator::message::{Message, MessagePattern, TypedPayload};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping { seq: u32 }
///
/// impl TypedPayload for Ping {
///     const MESSAGE_TYPE: &'static str = "diag.ping";
/// }
///
/// let msg = Message::typed(MessagePattern::Event, &Ping { seq: 1 }).unwrap();
/// assert_eq!(msg.decode::<Ping>().unwrap().seq, 1);
/// ```
pub trait TypedPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Routing key of messages carrying this payload
    const MESSAGE_TYPE: &'static str;
}

impl Message {
    /// Create a message whose type tag comes from the payload type
    pub fn typed<P: TypedPayload>(pattern: MessagePattern, payload: &P) -> Result<Self, PayloadError> {
        let value = serde_json::to_value(payload).map_err(PayloadError::Encode)?;
        Ok(Self::new(P::MESSAGE_TYPE, pattern, value))
    }

    /// Decode the payload after checking the type tag
    pub fn decode<P: TypedPayload>(&self) -> Result<P, PayloadError> {
        if self.message_type != P::MESSAGE_TYPE {
            return Err(PayloadError::TypeMismatch {
                expected: P::MESSAGE_TYPE,
                actual: self.message_type.clone(),
            });
        }
        self.payload_as()
    }

    /// Decode the payload into any shape without a type check
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(PayloadError::Decode)
    }
}

/// Where a piece of inbound content came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentSource {
    Email {
        message_id: String,
        from: String,
        subject: Option<String>,
    },
    Pdf {
        location: String,
    },
    Url {
        url: String,
    },
}

/// Request to run inbound content through the agent pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentProcess {
    pub source: ContentSource,
    /// Workflow definition to run for this content
    #[serde(default)]
    pub workflow: Option<String>,
}

impl TypedPayload for ContentProcess {
    const MESSAGE_TYPE: &'static str = "content.process";
}

/// Emitted when a digest for processed content is available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestReady {
    pub workflow_id: uuid::Uuid,
    pub summary: String,
    #[serde(default)]
    pub highlights: Vec<String>,
}

impl TypedPayload for DigestReady {
    const MESSAGE_TYPE: &'static str = "digest.ready";
}

/// One workflow step's work item sent to an agent
///
/// Travels as the payload of a request-response message on
/// `agent.<name>`; the agent's reply payload is the step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub workflow_id: uuid::Uuid,
    pub step_id: String,
    pub task_type: String,
    pub input: serde_json::Value,
    /// Workflow-level attempt of this step, starting at 1
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}
