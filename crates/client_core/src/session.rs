use std::collections::HashSet;

use serde_json::{json, Value};
use shared::{
    domain::{ClientId, MessageId, PathSegment},
    protocol::{
        CallReturn, InboundEvent, RenderFrame, WireMessage, WrapperProps, CALL_FUNC, MESSAGE_ACK,
        UPDATE_MODEL,
    },
};
use tracing::debug;

use crate::error::{RemoteError, SessionError};

/// What a render frame asks of the client.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// One `message_ack` per message in the frame, including ones seen before.
    pub acks: Vec<InboundEvent>,
    /// Messages surfaced for the first time that are not call returns.
    pub messages: Vec<WireMessage>,
    /// Call returns resolved by this frame, keyed by return id.
    pub returns: Vec<(String, Result<Value, RemoteError>)>,
    pub model_changed: bool,
}

/// Client half of the render boundary, independent of the transport.
///
/// Messages are redelivered on every render until acked, so each id is surfaced once
/// and acked every time it shows up.
#[derive(Debug, Default)]
pub struct ClientSession {
    client_id: Option<ClientId>,
    model: Value,
    component_props: Value,
    seen: HashSet<MessageId>,
    pending_calls: HashSet<String>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn model(&self) -> &Value {
        &self.model
    }

    pub fn component_props(&self) -> &Value {
        &self.component_props
    }

    pub fn pending_calls(&self) -> usize {
        self.pending_calls.len()
    }

    pub fn apply_frame(&mut self, frame: RenderFrame) -> FrameOutcome {
        let RenderFrame {
            wrapper_props:
                WrapperProps {
                    client_id,
                    messages,
                    model,
                },
            component_props,
        } = frame;
        if self.client_id.as_ref() != Some(&client_id) {
            debug!(%client_id, "client id assigned");
            self.client_id = Some(client_id.clone());
        }

        let mut outcome = FrameOutcome {
            model_changed: self.model != model,
            ..FrameOutcome::default()
        };
        self.model = model;
        self.component_props = component_props;

        let present: HashSet<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        for message in messages {
            outcome.acks.push(InboundEvent::new(
                MESSAGE_ACK,
                json!(message.id),
                client_id.clone(),
            ));
            if !self.seen.insert(message.id.clone()) {
                continue;
            }
            if self.pending_calls.remove(&message.kind) {
                let returned = serde_json::from_value::<CallReturn>(message.payload)
                    .map_err(|error| RemoteError(format!("malformed call return: {error}")))
                    .and_then(|ret| ret.into_result().map_err(RemoteError));
                outcome.returns.push((message.kind, returned));
            } else {
                outcome.messages.push(message);
            }
        }
        // Acked ids never come back, so only ids still queued need remembering.
        self.seen.retain(|id| present.contains(id));
        outcome
    }

    /// Registers a pending call and returns its return id and the `call_func` event.
    pub fn begin_call(
        &mut self,
        path: Vec<PathSegment>,
        args: Vec<Value>,
    ) -> Result<(String, InboundEvent), SessionError> {
        let client_id = self.client_id.clone().ok_or(SessionError::NotConnected)?;
        let return_id = format!("return-{}", MessageId::generate());
        self.pending_calls.insert(return_id.clone());
        let event = InboundEvent::new(
            CALL_FUNC,
            json!({ "path": path, "returnId": return_id, "args": args }),
            client_id,
        );
        Ok((return_id, event))
    }

    pub fn cancel_call(&mut self, return_id: &str) -> bool {
        self.pending_calls.remove(return_id)
    }

    /// Applies `value` to the local model and returns the `update_model` event. The
    /// backend does not echo a client's own updates back to it.
    pub fn update_model(
        &mut self,
        path: Vec<PathSegment>,
        value: Value,
    ) -> Result<InboundEvent, SessionError> {
        let client_id = self.client_id.clone().ok_or(SessionError::NotConnected)?;
        assign(&mut self.model, &path, value.clone())?;
        Ok(InboundEvent::new(
            UPDATE_MODEL,
            json!({ "path": path, "value": value }),
            client_id,
        ))
    }

    pub fn message(
        &self,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<InboundEvent, SessionError> {
        let client_id = self.client_id.clone().ok_or(SessionError::NotConnected)?;
        Ok(InboundEvent::new(kind, payload, client_id))
    }
}

fn assign(root: &mut Value, path: &[PathSegment], value: Value) -> Result<(), SessionError> {
    let invalid = || SessionError::InvalidPath {
        path: display_path(path),
    };
    let Some((last, parents)) = path.split_last() else {
        return Err(SessionError::EmptyPath);
    };
    let mut node = root;
    for segment in parents {
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i),
            _ => None,
        }
        .ok_or_else(invalid)?;
    }
    match (node, last) {
        (Value::Object(map), PathSegment::Key(key)) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        (Value::Array(items), PathSegment::Index(i)) if *i < items.len() => {
            items[*i] = value;
            Ok(())
        }
        _ => Err(invalid()),
    }
}

fn display_path(path: &[PathSegment]) -> String {
    path.iter().map(|segment| format!("/{segment}")).collect()
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
