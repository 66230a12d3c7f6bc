use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use parking_lot::Mutex;
use shared::domain::Tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Observer = Arc<dyn Fn(&Tag) + Send + Sync>;

/// Observer registry shared by every view of one model.
#[derive(Default)]
pub struct Observable {
    next_id: AtomicU64,
    observers: Mutex<IndexMap<SubscriptionId, Observer>>,
}

impl Observable {
    pub fn observe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Tag) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.observers.lock().insert(id, Arc::new(callback));
        id
    }

    /// Returns `false` when `id` was not registered.
    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        self.observers.lock().shift_remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every observer registered at the time of the call, in registration order.
    /// The registry lock is released first so callbacks may (un)subscribe.
    pub fn notify(&self, tag: &Tag) {
        let observers: Vec<Observer> = self.observers.lock().values().cloned().collect();
        for observer in observers {
            observer(tag);
        }
    }
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("observers", &self.len())
            .finish()
    }
}
