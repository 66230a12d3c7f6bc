use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use anyhow::Context;
use indexmap::IndexMap;
use model::{Model, ModelFunction, ModelView, Node, SubscriptionId, Tag};
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{ClientId, MessageId},
    protocol::{InboundEvent, InboundMessage, RenderFrame},
};
use tracing::{debug, info};

use crate::{
    bridge::RemoteCallBridge,
    channel::{ChannelDetach, MessageChannel, Updater},
    dispatcher::{Action, ActionDispatcher, DispatchOutcome},
    error::{HistoryError, WidgetError},
    history::History,
    render::{Flusher, RenderHub},
    ACTIONS_KEY, STATE_KEY,
};

type Receiver = Arc<dyn Fn(&str, &Value, &ClientId) + Send + Sync>;

struct WidgetInner {
    component_name: String,
    model: Model,
    channel: MessageChannel,
    hub: Arc<RenderHub>,
    bridge: RemoteCallBridge,
    dispatcher: ActionDispatcher,
    history: History,
    receivers: Mutex<IndexMap<u64, (String, Receiver)>>,
    next_receiver: AtomicU64,
}

/// One hosted widget instance: its model, connected clients, actions and history.
/// Clones share the same instance.
#[derive(Clone)]
pub struct Widget {
    inner: Arc<WidgetInner>,
}

#[derive(Clone)]
pub struct WeakWidget(Weak<WidgetInner>);

impl WeakWidget {
    pub fn upgrade(&self) -> Option<Widget> {
        self.0.upgrade().map(|inner| Widget { inner })
    }
}

impl Widget {
    /// Creates a widget over `root`, which must be a map. Missing `state` and
    /// `actions` keys are added empty.
    pub fn new(
        component_name: impl Into<String>,
        component_props: Value,
        root: impl Into<Node>,
    ) -> Result<Self, WidgetError> {
        let mut root = root.into();
        match &mut root {
            Node::Map(entries) => {
                for key in [STATE_KEY, ACTIONS_KEY] {
                    entries.entry(key.to_string()).or_insert_with(Node::empty_map);
                }
            }
            other => return Err(WidgetError::InvalidRoot { kind: other.kind() }),
        }

        let model = Model::new(root);
        let channel = MessageChannel::new();
        let history = History::new();
        let hub = Arc::new(RenderHub::new(
            model.clone(),
            channel.clone(),
            component_props,
        ));
        let flusher: Arc<dyn Flusher> = hub.clone();
        let component_name = component_name.into();
        info!(component = %component_name, "widget created");
        Ok(Self {
            inner: Arc::new(WidgetInner {
                component_name,
                bridge: RemoteCallBridge::new(model.clone(), channel.clone()),
                dispatcher: ActionDispatcher::new(model.clone(), flusher, history.clone()),
                model,
                channel,
                hub,
                history,
                receivers: Mutex::new(IndexMap::new()),
                next_receiver: AtomicU64::new(0),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakWidget {
        WeakWidget(Arc::downgrade(&self.inner))
    }

    pub fn component_name(&self) -> &str {
        &self.inner.component_name
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    /// Backend-tagged view of the recorded `state` subtree.
    pub fn state(&self) -> ModelView {
        self.inner.model.view(vec![STATE_KEY.into()], Tag::Backend)
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.inner.channel
    }

    pub fn history(&self) -> &History {
        &self.inner.history
    }

    /// Connects a client. `updater` is called whenever the client should render: on
    /// new messages, on flushes, and on model changes not tagged with this client.
    pub fn attach(&self, client_id: ClientId, updater: Updater) -> Result<Attachment, WidgetError> {
        let channel = self.inner.channel.attach(client_id.clone(), Arc::clone(&updater))?;
        let own = client_id.clone();
        let subscription = self.inner.model.observe(move |tag| {
            if !tag.is_client(&own) {
                updater();
            }
        });
        info!(component = %self.inner.component_name, %client_id, "client attached");
        Ok(Attachment {
            widget: self.clone(),
            client_id,
            channel: Some(channel),
            subscription,
        })
    }

    pub fn render(&self, client_id: &ClientId) -> Result<RenderFrame, WidgetError> {
        self.inner.hub.render(client_id)
    }

    /// Renders every attached client; resolves once each has rendered or detached.
    pub async fn flush(&self) {
        self.inner.hub.flush().await;
    }

    pub fn send(&self, kind: impl Into<String>, payload: Value) -> MessageId {
        self.inner.channel.send(kind, payload)
    }

    /// Applies one inbound event from the render bridge, then hands it to the
    /// receivers registered for its type.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<(), WidgetError> {
        let client_id = &event.client_id;
        match event.decode()? {
            InboundMessage::MessageAck(message_id) => {
                if !self.inner.channel.ack(client_id, &message_id) {
                    debug!(%client_id, %message_id, "ack for unknown message ignored");
                }
            }
            InboundMessage::UpdateModel { path, value } => {
                self.inner
                    .model
                    .set(&path, value, &Tag::Client(client_id.clone()))?;
            }
            InboundMessage::CallFunc {
                path,
                return_id,
                args,
            } => {
                self.inner
                    .bridge
                    .call(&path, args, &return_id, client_id)
                    .await;
            }
            InboundMessage::Custom { .. } => {}
        }
        self.notify_receivers(&event.kind, &event.payload, client_id);
        Ok(())
    }

    /// Registers `receiver` for inbound messages of type `kind`.
    pub fn on_message<F>(&self, kind: impl Into<String>, receiver: F) -> ReceiverHandle
    where
        F: Fn(&str, &Value, &ClientId) + Send + Sync + 'static,
    {
        let id = self.inner.next_receiver.fetch_add(1, Ordering::Relaxed);
        self.inner
            .receivers
            .lock()
            .insert(id, (kind.into(), Arc::new(receiver)));
        ReceiverHandle {
            widget: self.downgrade(),
            id,
        }
    }

    fn notify_receivers(&self, kind: &str, payload: &Value, client_id: &ClientId) {
        let matching: Vec<Receiver> = self
            .inner
            .receivers
            .lock()
            .values()
            .filter(|(k, _)| k == kind)
            .map(|(_, receiver)| Arc::clone(receiver))
            .collect();
        for receiver in matching {
            receiver(kind, payload, client_id);
        }
    }

    /// Registers an action and exposes it to clients as the function `actions.<name>`.
    pub fn define(
        &self,
        name: impl Into<String>,
        action: Action,
        recorded: bool,
    ) -> Result<(), WidgetError> {
        let name = name.into();
        self.inner.dispatcher.define(name.clone(), action, recorded);
        let weak = self.downgrade();
        let action_name = name.clone();
        let remote = ModelFunction::future(move |args| {
            let widget = weak.upgrade();
            let name = action_name.clone();
            async move {
                let widget = widget.context("widget was dropped")?;
                widget.dispatch(&name, args).await?;
                Ok(Value::Null)
            }
        });
        self.inner
            .model
            .set(&[ACTIONS_KEY.into(), name.into()], remote, &Tag::Backend)?;
        Ok(())
    }

    pub async fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<DispatchOutcome, WidgetError> {
        Ok(self.inner.dispatcher.dispatch(name, args).await?)
    }

    /// Writes the snapshot at `index` back into `state`. Waits for any running action.
    pub async fn restore_state(&self, index: i64) -> Result<(), WidgetError> {
        let index = usize::try_from(index).map_err(|_| HistoryError::OutOfRange {
            index,
            len: self.inner.history.len(),
        })?;
        let _running = self.inner.dispatcher.exclusive().await;
        self.inner.history.restore_into(&self.inner.model, index)?;
        Ok(())
    }

    pub async fn pop_state(&self) -> Result<(), WidgetError> {
        let _running = self.inner.dispatcher.exclusive().await;
        self.inner.history.pop_into(&self.inner.model)?;
        Ok(())
    }
}

/// Unregisters a message receiver.
pub struct ReceiverHandle {
    widget: WeakWidget,
    id: u64,
}

impl ReceiverHandle {
    /// Returns `false` when the receiver was already stopped.
    pub fn stop(&self) -> bool {
        self.widget.upgrade().is_some_and(|widget| {
            widget
                .inner
                .receivers
                .lock()
                .shift_remove(&self.id)
                .is_some()
        })
    }
}

/// A connected client. Dropping it detaches the client: its queue, updater and model
/// observer are removed together and pending flushes stop waiting on it.
#[must_use = "dropping the attachment detaches the client"]
pub struct Attachment {
    widget: Widget,
    client_id: ClientId,
    channel: Option<ChannelDetach>,
    subscription: SubscriptionId,
}

impl Attachment {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn widget(&self) -> &Widget {
        &self.widget
    }

    pub fn detach(self) {}
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        channel.detach();
        self.widget.inner.model.unobserve(self.subscription);
        self.widget.inner.hub.rendered(&self.client_id);
        info!(
            component = %self.widget.inner.component_name,
            client_id = %self.client_id,
            "client detached"
        );
    }
}

#[cfg(test)]
#[path = "tests/widget_tests.rs"]
mod tests;
