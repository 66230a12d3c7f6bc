use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use indexmap::IndexMap;
use model::Model;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::ClientId,
    protocol::{RenderFrame, WrapperProps},
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{channel::MessageChannel, error::WidgetError};

/// Drives a render pass of every attached client.
#[async_trait]
pub trait Flusher: Send + Sync {
    /// Resolves once the pass has been committed locally. Remote acks arrive later
    /// through the message channel.
    async fn flush(&self);
}

struct PendingFlush {
    waiting: HashSet<ClientId>,
    done: oneshot::Sender<()>,
}

/// Builds render frames and tracks which clients have rendered since each flush began.
pub struct RenderHub {
    model: Model,
    channel: MessageChannel,
    component_props: Value,
    pending: Mutex<IndexMap<u64, PendingFlush>>,
    next_flush: AtomicU64,
}

impl RenderHub {
    pub fn new(model: Model, channel: MessageChannel, component_props: Value) -> Self {
        Self {
            model,
            channel,
            component_props,
            pending: Mutex::new(IndexMap::new()),
            next_flush: AtomicU64::new(0),
        }
    }

    /// Frame for `client_id`: its unacked messages plus the current model export. The
    /// client counts as rendered for pending flushes even when the export fails, so a
    /// model that cannot be exported does not stall dispatches.
    pub fn render(&self, client_id: &ClientId) -> Result<RenderFrame, WidgetError> {
        if !self.channel.is_attached(client_id) {
            return Err(WidgetError::UnknownClient(client_id.clone()));
        }
        let messages = self.channel.pending(client_id);
        let exported = self.model.export();
        self.rendered(client_id);
        let model = exported.inspect_err(|error| {
            warn!(%client_id, %error, "model export failed during render");
        })?;
        Ok(RenderFrame {
            wrapper_props: WrapperProps {
                client_id: client_id.clone(),
                messages,
                model,
            },
            component_props: self.component_props.clone(),
        })
    }

    /// Marks `client_id` as rendered (or gone) for every flush waiting on it.
    pub fn rendered(&self, client_id: &ClientId) {
        let finished: Vec<PendingFlush> = {
            let mut pending = self.pending.lock();
            for flush in pending.values_mut() {
                flush.waiting.remove(client_id);
            }
            let done: Vec<u64> = pending
                .iter()
                .filter(|(_, flush)| flush.waiting.is_empty())
                .map(|(id, _)| *id)
                .collect();
            done.into_iter()
                .filter_map(|id| pending.shift_remove(&id))
                .collect()
        };
        for flush in finished {
            let _ = flush.done.send(());
        }
    }

    pub fn pending_flushes(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl Flusher for RenderHub {
    async fn flush(&self) {
        let clients = self.channel.clients();
        if clients.is_empty() {
            return;
        }
        let (done, wait) = oneshot::channel();
        let id = self.next_flush.fetch_add(1, Ordering::Relaxed);
        debug!(flush = id, clients = clients.len(), "flush started");
        self.pending.lock().insert(
            id,
            PendingFlush {
                waiting: clients.iter().cloned().collect(),
                done,
            },
        );
        self.channel.trigger_all();
        // A client that detached before the flush was registered will never render.
        for client_id in clients.iter().filter(|id| !self.channel.is_attached(id)) {
            self.rendered(client_id);
        }
        let _ = wait.await;
        debug!(flush = id, "flush committed");
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
