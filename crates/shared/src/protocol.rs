use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ClientId, MessageId, PathSegment},
    error::ProtocolError,
};

pub const MESSAGE_ACK: &str = "message_ack";
pub const UPDATE_MODEL: &str = "update_model";
pub const CALL_FUNC: &str = "call_func";

/// Outbound message held in a client's queue until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub id: MessageId,
}

/// `message` event emitted by the render bridge, carried as `[type, payload, clientId]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, Value, ClientId)", into = "(String, Value, ClientId)")]
pub struct InboundEvent {
    pub kind: String,
    pub payload: Value,
    pub client_id: ClientId,
}

impl InboundEvent {
    pub fn new(kind: impl Into<String>, payload: Value, client_id: ClientId) -> Self {
        Self {
            kind: kind.into(),
            payload,
            client_id,
        }
    }

    pub fn decode(&self) -> Result<InboundMessage, ProtocolError> {
        InboundMessage::decode(&self.kind, self.payload.clone())
    }
}

impl From<(String, Value, ClientId)> for InboundEvent {
    fn from((kind, payload, client_id): (String, Value, ClientId)) -> Self {
        Self {
            kind,
            payload,
            client_id,
        }
    }
}

impl From<InboundEvent> for (String, Value, ClientId) {
    fn from(value: InboundEvent) -> Self {
        (value.kind, value.payload, value.client_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    MessageAck(MessageId),
    UpdateModel {
        path: Vec<PathSegment>,
        value: Value,
    },
    CallFunc {
        path: Vec<PathSegment>,
        return_id: String,
        args: Vec<Value>,
    },
    /// Application-defined message type, forwarded to registered receivers.
    Custom { kind: String, payload: Value },
}

#[derive(Debug, Deserialize)]
struct UpdateModelPayload {
    #[serde(default)]
    path: Option<Vec<PathSegment>>,
    #[serde(default)]
    key: Option<PathSegment>,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallFuncPayload {
    #[serde(default)]
    path: Option<Vec<PathSegment>>,
    #[serde(default)]
    key: Option<PathSegment>,
    return_id: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn target_path(
    kind: &str,
    path: Option<Vec<PathSegment>>,
    key: Option<PathSegment>,
) -> Result<Vec<PathSegment>, ProtocolError> {
    match (path, key) {
        (Some(path), _) => Ok(path),
        (None, Some(key)) => Ok(vec![key]),
        (None, None) => Err(ProtocolError::MissingTarget {
            kind: kind.to_string(),
        }),
    }
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload {
        kind: kind.to_string(),
        source,
    })
}

impl InboundMessage {
    pub fn decode(kind: &str, payload: Value) -> Result<Self, ProtocolError> {
        match kind {
            MESSAGE_ACK => Ok(Self::MessageAck(parse(kind, payload)?)),
            UPDATE_MODEL => {
                let p: UpdateModelPayload = parse(kind, payload)?;
                Ok(Self::UpdateModel {
                    path: target_path(kind, p.path, p.key)?,
                    value: p.value,
                })
            }
            CALL_FUNC => {
                let p: CallFuncPayload = parse(kind, payload)?;
                Ok(Self::CallFunc {
                    path: target_path(kind, p.path, p.key)?,
                    return_id: p.return_id,
                    args: p.args,
                })
            }
            other => Ok(Self::Custom {
                kind: other.to_string(),
                payload,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::MessageAck(_) => MESSAGE_ACK,
            Self::UpdateModel { .. } => UPDATE_MODEL,
            Self::CallFunc { .. } => CALL_FUNC,
            Self::Custom { kind, .. } => kind,
        }
    }
}

/// Result of a remote call, carried as `[value, error]` under the call's `returnId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Value, Option<String>)", into = "(Value, Option<String>)")]
pub struct CallReturn {
    pub value: Value,
    pub error: Option<String>,
}

impl CallReturn {
    pub fn ok(value: Value) -> Self {
        Self { value, error: None }
    }

    pub fn err(description: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            error: Some(description.into()),
        }
    }

    pub fn to_payload(&self) -> Value {
        Value::Array(vec![
            self.value.clone(),
            self.error.clone().map_or(Value::Null, Value::String),
        ])
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }
}

impl From<(Value, Option<String>)> for CallReturn {
    fn from((value, error): (Value, Option<String>)) -> Self {
        Self { value, error }
    }
}

impl From<CallReturn> for (Value, Option<String>) {
    fn from(value: CallReturn) -> Self {
        (value.value, value.error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapperProps {
    pub client_id: ClientId,
    pub messages: Vec<WireMessage>,
    pub model: Value,
}

/// Props delivered to the render bridge on every render of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderFrame {
    pub wrapper_props: WrapperProps,
    pub component_props: Value,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
