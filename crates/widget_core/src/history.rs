use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use model::{Model, ModelError, Node, Tag};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{error::HistoryError, STATE_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub args: Vec<Value>,
}

/// A recorded action and the state it produced. Immutable once created.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    action: ActionDescriptor,
    state: Node,
    recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// `state` should already be detached from the live model, e.g. from `Model::get`.
    pub fn new(action: ActionDescriptor, state: Node) -> Self {
        Self {
            action,
            state,
            recorded_at: Utc::now(),
        }
    }

    pub fn action(&self) -> &ActionDescriptor {
        &self.action
    }

    pub fn state(&self) -> &Node {
        &self.state
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn export(&self) -> Result<Value, ModelError> {
        Ok(json!({
            "action": { "name": self.action.name, "args": self.action.args },
            "state": self.state.export()?,
            "recordedAt": self.recorded_at.to_rfc3339(),
        }))
    }
}

/// Index-addressable list of recorded states with a movable cursor.
#[derive(Debug, Default)]
pub struct HistoryStack {
    entries: Vec<HistoryEntry>,
    current: Option<usize>,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry after the cursor, appends `entry` and moves the cursor to it.
    pub fn push(&mut self, entry: HistoryEntry) -> usize {
        let keep = self.current.map_or(0, |i| i + 1);
        self.entries.truncate(keep);
        self.entries.push(entry);
        let index = self.entries.len() - 1;
        self.current = Some(index);
        index
    }

    /// Moves the cursor to `index`. Entries after it are kept until the next push.
    pub fn restore(&mut self, index: usize) -> Result<&HistoryEntry, HistoryError> {
        if index >= self.entries.len() {
            return Err(self.out_of_range(index as i64));
        }
        self.current = Some(index);
        Ok(&self.entries[index])
    }

    pub fn pop(&mut self) -> Result<&HistoryEntry, HistoryError> {
        let previous = self.previous_index()?;
        self.restore(previous)
    }

    pub fn previous_index(&self) -> Result<usize, HistoryError> {
        match self.current {
            Some(i) if i > 0 => Ok(i - 1),
            _ => Err(HistoryError::NoEarlierState),
        }
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    fn out_of_range(&self, index: i64) -> HistoryError {
        HistoryError::OutOfRange {
            index,
            len: self.entries.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEvent {
    Pushed { index: usize },
    Restored { index: usize },
}

type ChangeListener = Arc<dyn Fn(HistoryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct HistoryShared {
    stack: Mutex<HistoryStack>,
    listeners: Mutex<IndexMap<ListenerId, ChangeListener>>,
    next_listener: AtomicU64,
}

/// Shared history of one widget. Restores write the stored snapshot back into the
/// widget model's `state` key.
#[derive(Clone, Default)]
pub struct History {
    shared: Arc<HistoryShared>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: HistoryEntry) -> usize {
        let name = entry.action.name.clone();
        let index = self.shared.stack.lock().push(entry);
        debug!(action = %name, index, "history entry pushed");
        self.emit(HistoryEvent::Pushed { index });
        index
    }

    /// Copies the snapshot at `index` into the live model and moves the cursor there.
    /// On error neither the model nor the cursor changes.
    pub fn restore_into(&self, model: &Model, index: usize) -> Result<(), HistoryError> {
        let snapshot = {
            let stack = self.shared.stack.lock();
            match stack.get(index) {
                Some(entry) => entry.state().clone(),
                None => return Err(stack.out_of_range(index as i64)),
            }
        };
        model.set(&[STATE_KEY.into()], snapshot, &Tag::Backend)?;
        self.shared.stack.lock().restore(index)?;
        debug!(index, "history restored");
        self.emit(HistoryEvent::Restored { index });
        Ok(())
    }

    pub fn pop_into(&self, model: &Model) -> Result<(), HistoryError> {
        let previous = self.shared.stack.lock().previous_index()?;
        self.restore_into(model, previous)
    }

    pub fn len(&self) -> usize {
        self.shared.stack.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_index(&self) -> Option<usize> {
        self.shared.stack.lock().current_index()
    }

    pub fn get(&self, index: usize) -> Option<HistoryEntry> {
        self.shared.stack.lock().get(index).cloned()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.shared.stack.lock().entries().to_vec()
    }

    /// Registers a listener called after every push and restore.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(HistoryEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn off_change(&self, id: ListenerId) -> bool {
        self.shared.listeners.lock().shift_remove(&id).is_some()
    }

    fn emit(&self, event: HistoryEvent) {
        let listeners: Vec<ChangeListener> =
            self.shared.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
