use std::backtrace::{Backtrace, BacktraceStatus};

use model::{display_path, Model, Node};
use serde_json::Value;
use shared::{
    domain::{ClientId, PathSegment},
    protocol::CallReturn,
};
use tracing::{debug, warn};

use crate::channel::MessageChannel;

pub const FUNCTION_NOT_FOUND: &str = "function not found";

/// Invokes model functions for remote callers. Every outcome, including a missing
/// function, an error or a panic, is delivered as a `[value, error]` message under
/// the caller's return id; nothing propagates to the caller as a failure.
#[derive(Clone)]
pub struct RemoteCallBridge {
    model: Model,
    channel: MessageChannel,
}

impl RemoteCallBridge {
    pub fn new(model: Model, channel: MessageChannel) -> Self {
        Self { model, channel }
    }

    pub async fn call(
        &self,
        path: &[PathSegment],
        args: Vec<Value>,
        return_id: &str,
        client_id: &ClientId,
    ) -> CallReturn {
        let outcome = self.invoke(path, args).await;
        if let Some(description) = &outcome.error {
            let error = description.lines().next().unwrap_or_default();
            warn!(%client_id, path = %display_path(path), %return_id, %error, "remote call failed");
        } else {
            debug!(%client_id, path = %display_path(path), %return_id, "remote call returned");
        }
        if self
            .channel
            .send_to(client_id, return_id, outcome.to_payload())
            .is_none()
        {
            debug!(%client_id, %return_id, "caller detached before the call returned");
        }
        outcome
    }

    pub async fn invoke(&self, path: &[PathSegment], args: Vec<Value>) -> CallReturn {
        let function = match self.model.get(path) {
            Ok(Node::Function(function)) => function,
            Ok(other) => {
                return CallReturn::err(format!(
                    "`{}` is a {}, not a function",
                    display_path(path),
                    other.kind()
                ))
            }
            Err(_) => return CallReturn::err(FUNCTION_NOT_FOUND),
        };
        match function.invoke_caught(args).await {
            Ok(value) => CallReturn::ok(value),
            Err(error) => CallReturn::err(describe(&error)),
        }
    }
}

/// Error chain on the first line, then a stack trace: the one captured with the
/// error when backtraces are enabled, otherwise the stack at the call boundary.
fn describe(error: &anyhow::Error) -> String {
    let captured = error.backtrace();
    let stack = if matches!(captured.status(), BacktraceStatus::Captured) {
        captured.to_string()
    } else {
        Backtrace::force_capture().to_string()
    };
    format!("{error:#}\n\nstack backtrace:\n{stack}")
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
