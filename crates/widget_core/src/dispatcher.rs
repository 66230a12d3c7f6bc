use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use indexmap::IndexMap;
use model::{Model, ModelView, Tag};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    error::DispatchError,
    history::{ActionDescriptor, History, HistoryEntry},
    render::Flusher,
    STATE_KEY,
};

/// One discrete step of a phased action. The dispatcher flushes between phases.
pub type Phase = Box<dyn FnOnce(&ActionContext) -> anyhow::Result<()> + Send>;

type PlainFn = dyn Fn(&ActionContext, &[Value]) -> anyhow::Result<()> + Send + Sync;
type PhasedFn = dyn Fn(&[Value]) -> Vec<Phase> + Send + Sync;
type AsyncFn =
    dyn Fn(ActionContext, Vec<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

pub fn phase<F>(f: F) -> Phase
where
    F: FnOnce(&ActionContext) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(f)
}

#[derive(Clone)]
pub enum Action {
    /// Runs to completion; one flush afterwards.
    Plain(Arc<PlainFn>),
    /// Returns its phases up front; a flush follows every phase.
    Phased(Arc<PhasedFn>),
    /// Flushes after each [`ActionContext::suspend`] and once at completion.
    Async(Arc<AsyncFn>),
}

impl Action {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&ActionContext, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Plain(Arc::new(f))
    }

    pub fn phased<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Vec<Phase> + Send + Sync + 'static,
    {
        Self::Phased(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(ActionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx, args| f(ctx, args).boxed()))
    }
}

/// Handle given to a running action.
#[derive(Clone)]
pub struct ActionContext {
    model: Model,
    flusher: Arc<dyn Flusher>,
    flushes: Arc<AtomicUsize>,
}

impl ActionContext {
    fn new(model: Model, flusher: Arc<dyn Flusher>) -> Self {
        Self {
            model,
            flusher,
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Backend-tagged view of the recorded `state` subtree.
    pub fn state(&self) -> ModelView {
        self.model.view(vec![STATE_KEY.into()], Tag::Backend)
    }

    pub async fn flush(&self) {
        self.flusher.flush().await;
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Awaits `fut`, then flushes so clients see whatever changed before the suspension.
    pub async fn suspend<F: Future>(&self, fut: F) -> F::Output {
        let out = fut.await;
        self.flush().await;
        out
    }

    fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

struct RegisteredAction {
    action: Action,
    recorded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub flushes: usize,
    /// History index of the recorded entry, for recorded actions.
    pub history_index: Option<usize>,
}

/// Runs named actions one at a time against a widget model.
///
/// An action must not dispatch on its own dispatcher: the run lock is held for the
/// whole dispatch, so doing so waits forever. In-flight actions cannot be cancelled.
pub struct ActionDispatcher {
    model: Model,
    flusher: Arc<dyn Flusher>,
    history: History,
    actions: RwLock<IndexMap<String, RegisteredAction>>,
    run_lock: Mutex<()>,
}

impl ActionDispatcher {
    pub fn new(model: Model, flusher: Arc<dyn Flusher>, history: History) -> Self {
        Self {
            model,
            flusher,
            history,
            actions: RwLock::new(IndexMap::new()),
            run_lock: Mutex::new(()),
        }
    }

    /// Registers `action` under `name`, replacing any previous definition.
    pub fn define(&self, name: impl Into<String>, action: Action, recorded: bool) {
        let name = name.into();
        debug!(action = %name, recorded, "action defined");
        self.actions
            .write()
            .insert(name, RegisteredAction { action, recorded });
    }

    pub fn names(&self) -> Vec<String> {
        self.actions.read().keys().cloned().collect()
    }

    /// Waits for the running dispatch, if any, and blocks new ones while the guard lives.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    pub async fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (action, recorded) = {
            let actions = self.actions.read();
            let registered = actions.get(name).ok_or_else(|| DispatchError::NotFound {
                name: name.to_string(),
            })?;
            (registered.action.clone(), registered.recorded)
        };

        let _running = self.run_lock.lock().await;
        debug!(action = %name, "dispatch started");
        let ctx = ActionContext::new(self.model.clone(), Arc::clone(&self.flusher));
        let result = match &action {
            Action::Plain(f) => f(&ctx, &args),
            Action::Phased(f) => run_phases(&ctx, f(&args)).await,
            Action::Async(f) => f(ctx.clone(), args.clone()).await,
        };
        ctx.flush().await;

        if let Err(source) = result {
            warn!(action = %name, error = %source, "action failed");
            return Err(DispatchError::Failed {
                name: name.to_string(),
                source,
            });
        }

        let history_index = if recorded {
            let snapshot = self
                .model
                .get(&[STATE_KEY.into()])
                .map_err(|source| DispatchError::Snapshot {
                    name: name.to_string(),
                    source,
                })?;
            let entry = HistoryEntry::new(
                ActionDescriptor {
                    name: name.to_string(),
                    args,
                },
                snapshot,
            );
            Some(self.history.push(entry))
        } else {
            None
        };

        let outcome = DispatchOutcome {
            flushes: ctx.flush_count(),
            history_index,
        };
        debug!(action = %name, flushes = outcome.flushes, "dispatch finished");
        Ok(outcome)
    }
}

/// Runs every phase, flushing between consecutive phases. The caller flushes after
/// the last one. Stops at the first failing phase.
async fn run_phases(ctx: &ActionContext, phases: Vec<Phase>) -> anyhow::Result<()> {
    let count = phases.len();
    for (i, phase) in phases.into_iter().enumerate() {
        phase(ctx)?;
        if i + 1 < count {
            ctx.flush().await;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
