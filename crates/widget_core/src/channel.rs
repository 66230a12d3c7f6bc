use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{ClientId, MessageId},
    protocol::WireMessage,
};
use tracing::debug;

use crate::error::WidgetError;

/// Render trigger for one attached client.
pub type Updater = Arc<dyn Fn() + Send + Sync>;

struct ClientQueue {
    pending: Vec<WireMessage>,
    updater: Updater,
}

/// Per-client outbound queues. A message stays queued, and is redelivered on every
/// render of its client, until that client acks its id.
#[derive(Clone, Default)]
pub struct MessageChannel {
    clients: Arc<Mutex<IndexMap<ClientId, ClientQueue>>>,
}

/// Removes a client's queue and updater when consumed.
#[must_use = "dropping the handle leaves the client attached; call `detach`"]
pub struct ChannelDetach {
    channel: MessageChannel,
    client_id: ClientId,
}

impl ChannelDetach {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn detach(self) -> bool {
        self.channel.detach(&self.client_id)
    }
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        &self,
        client_id: ClientId,
        updater: Updater,
    ) -> Result<ChannelDetach, WidgetError> {
        let mut clients = self.clients.lock();
        if clients.contains_key(&client_id) {
            return Err(WidgetError::AlreadyAttached(client_id));
        }
        clients.insert(
            client_id.clone(),
            ClientQueue {
                pending: Vec::new(),
                updater,
            },
        );
        debug!(%client_id, "client attached to channel");
        Ok(ChannelDetach {
            channel: self.clone(),
            client_id,
        })
    }

    /// Drops the client's queue and updater together. Returns `false` if it was not attached.
    pub fn detach(&self, client_id: &ClientId) -> bool {
        let removed = self.clients.lock().shift_remove(client_id);
        if let Some(queue) = &removed {
            debug!(%client_id, dropped = queue.pending.len(), "client detached from channel");
        }
        removed.is_some()
    }

    /// Queues a message for every attached client and triggers their renders.
    pub fn send(&self, kind: impl Into<String>, payload: Value) -> MessageId {
        let message = WireMessage {
            kind: kind.into(),
            payload,
            id: MessageId::generate(),
        };
        let updaters: Vec<Updater> = {
            let mut clients = self.clients.lock();
            clients
                .values_mut()
                .map(|queue| {
                    queue.pending.push(message.clone());
                    Arc::clone(&queue.updater)
                })
                .collect()
        };
        debug!(
            kind = %message.kind,
            message_id = %message.id,
            clients = updaters.len(),
            "message queued"
        );
        for update in updaters {
            update();
        }
        message.id
    }

    /// Queues a message for a single client. Returns `None` when it is not attached.
    pub fn send_to(
        &self,
        client_id: &ClientId,
        kind: impl Into<String>,
        payload: Value,
    ) -> Option<MessageId> {
        let message = WireMessage {
            kind: kind.into(),
            payload,
            id: MessageId::generate(),
        };
        let updater = {
            let mut clients = self.clients.lock();
            let queue = clients.get_mut(client_id)?;
            queue.pending.push(message.clone());
            Arc::clone(&queue.updater)
        };
        debug!(%client_id, kind = %message.kind, message_id = %message.id, "message queued");
        updater();
        Some(message.id)
    }

    /// Removes exactly the message `message_id` from `client_id`'s queue. Unknown
    /// clients and ids are ignored, so repeated acks are harmless.
    pub fn ack(&self, client_id: &ClientId, message_id: &MessageId) -> bool {
        let mut clients = self.clients.lock();
        let Some(queue) = clients.get_mut(client_id) else {
            return false;
        };
        match queue.pending.iter().position(|m| &m.id == message_id) {
            Some(index) => {
                queue.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self, client_id: &ClientId) -> Vec<WireMessage> {
        self.clients
            .lock()
            .get(client_id)
            .map(|queue| queue.pending.clone())
            .unwrap_or_default()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.clients.lock().keys().cloned().collect()
    }

    pub fn is_attached(&self, client_id: &ClientId) -> bool {
        self.clients.lock().contains_key(client_id)
    }

    /// Triggers a render of every attached client, returning the ids that were triggered.
    pub fn trigger_all(&self) -> Vec<ClientId> {
        let targets: Vec<(ClientId, Updater)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, queue)| (id.clone(), Arc::clone(&queue.updater)))
            .collect();
        for (_, update) in &targets {
            update();
        }
        targets.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
