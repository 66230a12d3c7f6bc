use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::ClientId,
    protocol::{InboundEvent, CALL_FUNC},
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};
use tracing::{debug, info, warn};
use widget_core::{Widget, WidgetError};

/// Serves one websocket client of `widget` until the socket closes.
///
/// Every updater call wakes the render loop, which renders the client and queues the
/// frame for the socket writer. Wakeups that arrive while a render is pending coalesce.
/// Frames that find the writer's buffer full are dropped, and the writer wakes the render
/// loop again once it catches up so the client still ends on the latest state.
pub(crate) async fn connection(widget: Widget, socket: WebSocket, render_buffer: usize) {
    let client_id = ClientId::generate();
    let wake = Arc::new(Notify::new());
    let updater = {
        let wake = Arc::clone(&wake);
        Arc::new(move || wake.notify_one())
    };
    let attachment = match widget.attach(client_id.clone(), updater) {
        Ok(attachment) => attachment,
        Err(error) => {
            warn!(%client_id, %error, "failed to attach websocket client");
            return;
        }
    };
    info!(component = %widget.component_name(), %client_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(render_buffer);
    let backlog = Arc::new(AtomicBool::new(false));

    let render_task = tokio::spawn(render_loop(
        widget.clone(),
        client_id.clone(),
        Arc::clone(&wake),
        frames_tx,
        Arc::clone(&backlog),
    ));
    let send_task = {
        let wake = Arc::clone(&wake);
        tokio::spawn(async move {
            while let Some(text) = frames_rx.recv().await {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if backlog.swap(false, Ordering::AcqRel) {
                    wake.notify_one();
                }
            }
        })
    };
    wake.notify_one();

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => handle_text(&widget, &client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(attachment);
    render_task.abort();
    send_task.abort();
    info!(component = %widget.component_name(), %client_id, "websocket client disconnected");
}

/// Never waits on the socket: a render always completes, so flushes waiting on this
/// client resolve even when the writer is stuck.
async fn render_loop(
    widget: Widget,
    client_id: ClientId,
    wake: Arc<Notify>,
    frames: mpsc::Sender<String>,
    backlog: Arc<AtomicBool>,
) {
    loop {
        wake.notified().await;
        let frame = match widget.render(&client_id) {
            Ok(frame) => frame,
            Err(WidgetError::UnknownClient(_)) => break,
            Err(error) => {
                warn!(%client_id, %error, "render failed");
                continue;
            }
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                warn!(%client_id, %error, "failed to encode render frame");
                continue;
            }
        };
        match frames.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                backlog.store(true, Ordering::Release);
                debug!(%client_id, "socket backlog full; frame dropped");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn handle_text(widget: &Widget, client_id: &ClientId, text: &str) {
    let mut event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(error) => {
            warn!(%client_id, %error, "invalid inbound event");
            return;
        }
    };
    if event.client_id != *client_id {
        debug!(claimed = %event.client_id, %client_id, "replacing client id claimed by inbound event");
        event.client_id = client_id.clone();
    }

    // Calls may dispatch actions that wait on this client's next render.
    if event.kind == CALL_FUNC {
        let widget = widget.clone();
        tokio::spawn(async move {
            if let Err(error) = widget.handle_event(event).await {
                warn!(%error, "call_func rejected");
            }
        });
        return;
    }

    if let Err(error) = widget.handle_event(event).await {
        warn!(%client_id, %error, "inbound event rejected");
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
