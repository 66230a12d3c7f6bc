use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::Value;
use shared::{
    domain::{ClientId, PathSegment},
    protocol::{InboundEvent, RenderFrame, WireMessage},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

pub mod error;
pub mod session;

pub use error::{RemoteError, SessionError};
pub use session::{ClientSession, FrameOutcome};

type PendingReturns = HashMap<String, oneshot::Sender<Result<Value, RemoteError>>>;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A backend message, surfaced once per id.
    Message(WireMessage),
    Error(String),
    Closed,
}

/// Fetches the names of the widgets hosted at `server_url`.
pub async fn list_widgets(server_url: &str) -> Result<Vec<String>> {
    let url = format!("{}/widgets", server_url.trim_end_matches('/'));
    let names = Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json::<Vec<String>>()
        .await?;
    Ok(names)
}

/// Websocket URL of widget `name` on the server at `server_url` (`http(s)://host:port`).
pub fn widget_ws_url(server_url: &str, name: &str) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("server_url must use http or https, got {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket url from {server_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server url cannot have a path: {server_url}"))?
        .pop_if_empty()
        .extend(["widgets", name, "ws"]);
    Ok(url)
}

/// Live connection to one hosted widget.
pub struct WidgetClient {
    client_id: ClientId,
    session: Arc<Mutex<ClientSession>>,
    returns: Arc<Mutex<PendingReturns>>,
    outbound: mpsc::UnboundedSender<String>,
    model: Arc<watch::Sender<Value>>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl WidgetClient {
    /// Connects and waits for the first render frame, which assigns the client id.
    pub async fn connect(server_url: &str, name: &str) -> Result<Self> {
        let url = widget_ws_url(server_url, name)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let first = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<RenderFrame>(&text)
                        .context("invalid first render frame")?
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow!("websocket closed before the first render"))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err).context("websocket receive failed"),
            }
        };

        let mut session = ClientSession::new();
        let outcome = session.apply_frame(first);
        let client_id = session
            .client_id()
            .cloned()
            .context("first render frame carried no client id")?;
        info!(%client_id, widget = name, "connected to widget");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (model_tx, _) = watch::channel(session.model().clone());
        let model_tx = Arc::new(model_tx);
        let (events, _) = broadcast::channel(256);
        let session = Arc::new(Mutex::new(session));
        let returns = Arc::new(Mutex::new(PendingReturns::new()));

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let handler = FrameHandler {
            returns: Arc::clone(&returns),
            outbound: outbound.clone(),
            model: Arc::clone(&model_tx),
            events: events.clone(),
        };
        handler.handle(outcome, None).await;

        let frames = Arc::clone(&session);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RenderFrame>(&text) {
                        Ok(frame) => {
                            let (outcome, model) = {
                                let mut guard = frames.lock().await;
                                let outcome = guard.apply_frame(frame);
                                let model = outcome.model_changed.then(|| guard.model().clone());
                                (outcome, model)
                            };
                            handler.handle(outcome, model).await;
                        }
                        Err(err) => {
                            let _ = handler
                                .events
                                .send(ClientEvent::Error(format!("invalid render frame: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = handler.events.send(ClientEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
            handler.close().await;
        });

        Ok(Self {
            client_id,
            session,
            returns,
            outbound,
            model: model_tx,
            events,
            tasks: vec![writer, reader],
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Latest model received from the backend, including this client's own updates.
    pub fn model(&self) -> Value {
        self.model.borrow().clone()
    }

    pub fn watch_model(&self) -> WatchStream<Value> {
        WatchStream::new(self.model.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn update_model(&self, path: Vec<PathSegment>, value: Value) -> Result<()> {
        let (event, model) = {
            let mut session = self.session.lock().await;
            let event = session.update_model(path, value)?;
            (event, session.model().clone())
        };
        self.model.send_replace(model);
        self.send_event(&event)
    }

    /// Invokes the backend function at `path` and waits for its `[value, error]` return.
    pub async fn call(&self, path: Vec<PathSegment>, args: Vec<Value>) -> Result<Value> {
        let (return_id, event) = self.session.lock().await.begin_call(path, args)?;
        let (tx, rx) = oneshot::channel();
        self.returns.lock().await.insert(return_id.clone(), tx);
        if let Err(err) = self.send_event(&event) {
            self.returns.lock().await.remove(&return_id);
            self.session.lock().await.cancel_call(&return_id);
            return Err(err);
        }
        let value = rx
            .await
            .map_err(|_| anyhow!("connection closed before call {return_id} returned"))??;
        Ok(value)
    }

    /// Runs the widget action `name` through its `actions.<name>` function.
    pub async fn dispatch(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.call(
            vec![PathSegment::from("actions"), PathSegment::from(name)],
            args,
        )
        .await?;
        Ok(())
    }

    /// Sends an application-defined message to the widget's receivers.
    pub async fn send_message(&self, kind: &str, payload: Value) -> Result<()> {
        let event = self.session.lock().await.message(kind, payload)?;
        self.send_event(&event)
    }

    fn send_event(&self, event: &InboundEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow!("websocket connection closed"))
    }
}

impl Drop for WidgetClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Applies the side effects of a frame outside the session lock.
struct FrameHandler {
    returns: Arc<Mutex<PendingReturns>>,
    outbound: mpsc::UnboundedSender<String>,
    model: Arc<watch::Sender<Value>>,
    events: broadcast::Sender<ClientEvent>,
}

impl FrameHandler {
    async fn handle(&self, outcome: FrameOutcome, model: Option<Value>) {
        for ack in &outcome.acks {
            match serde_json::to_string(ack) {
                Ok(text) => {
                    let _ = self.outbound.send(text);
                }
                Err(err) => warn!(%err, "failed to encode ack"),
            }
        }
        if let Some(model) = model {
            self.model.send_replace(model);
        }
        if !outcome.returns.is_empty() {
            let mut returns = self.returns.lock().await;
            for (return_id, result) in outcome.returns {
                if let Some(tx) = returns.remove(&return_id) {
                    let _ = tx.send(result);
                }
            }
        }
        for message in outcome.messages {
            let _ = self.events.send(ClientEvent::Message(message));
        }
    }

    async fn close(&self) {
        // Dropping the senders fails every outstanding call.
        self.returns.lock().await.clear();
        let _ = self.events.send(ClientEvent::Closed);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
