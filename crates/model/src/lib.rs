//! Observable model tree shared between a widget backend and its clients.
//!
//! Every mutation carries a [`Tag`] naming the actor behind it, and every observer is
//! told that tag, so a client can skip re-rendering for its own echo.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

mod error;
mod node;
mod observable;

pub use error::{display_path, ModelError};
pub use node::{CallResult, ModelFunction, Node, Opaque};
pub use observable::{Observable, SubscriptionId};
pub use shared::domain::{PathSegment, Tag};

pub type Path = Vec<PathSegment>;

/// Builds a path from mixed keys and indices: `path!["state", "items", 0]`.
#[macro_export]
macro_rules! path {
    ($($segment:expr),* $(,)?) => {
        vec![$($crate::PathSegment::from($segment)),*]
    };
}

struct ModelInner {
    root: RwLock<Node>,
    observable: Observable,
}

/// Handle to a model tree. Clones share the same tree and observers.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new(Node::empty_map())
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("root", &*self.inner.root.read())
            .field("observable", &self.inner.observable)
            .finish()
    }
}

impl Model {
    pub fn new(root: impl Into<Node>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                root: RwLock::new(root.into()),
                observable: Observable::default(),
            }),
        }
    }

    /// Wraps `value` as the root of a fresh model and returns a root view carrying `tag`.
    /// Scalars and functions are stored unchanged.
    pub fn proxy(value: impl Into<Node>, tag: Tag) -> ModelView {
        Self::new(value).view(Vec::new(), tag)
    }

    pub fn view(&self, base: Path, tag: Tag) -> ModelView {
        ModelView {
            model: self.clone(),
            base,
            tag,
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a detached copy of the value at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Result<Node, ModelError> {
        self.read(path, Node::clone)
    }

    /// Borrows the value at `path` for the duration of `f`.
    pub fn read<R>(
        &self,
        path: &[PathSegment],
        f: impl FnOnce(&Node) -> R,
    ) -> Result<R, ModelError> {
        let root = self.inner.root.read();
        root.lookup(path).map(f)
    }

    pub fn contains(&self, path: &[PathSegment]) -> bool {
        self.inner.root.read().lookup(path).is_ok()
    }

    /// Assigns `value` at `path` and notifies observers with `tag`, even when the
    /// value is unchanged.
    pub fn set(
        &self,
        path: &[PathSegment],
        value: impl Into<Node>,
        tag: &Tag,
    ) -> Result<(), ModelError> {
        self.inner.root.write().assign(path, value.into())?;
        trace!(path = %display_path(path), %tag, "model set");
        self.notify(tag);
        Ok(())
    }

    /// Removes the value at `path`, returning it, and notifies observers with `tag`.
    pub fn delete(&self, path: &[PathSegment], tag: &Tag) -> Result<Node, ModelError> {
        let removed = self.inner.root.write().remove(path)?;
        trace!(path = %display_path(path), %tag, "model delete");
        self.notify(tag);
        Ok(removed)
    }

    /// Edits the node at `path` in place and sends a single notification with `tag`.
    /// When `edit` fails the error is returned and observers are not notified; `edit`
    /// must leave the node untouched in that case.
    pub fn update<R, E>(
        &self,
        path: &[PathSegment],
        tag: &Tag,
        edit: impl FnOnce(&mut Node) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<ModelError>,
    {
        let out = {
            let mut root = self.inner.root.write();
            let node = root.lookup_mut(path)?;
            edit(node)?
        };
        self.notify(tag);
        Ok(out)
    }

    pub fn notify(&self, tag: &Tag) {
        self.inner.observable.notify(tag);
    }

    pub fn observe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Tag) + Send + Sync + 'static,
    {
        self.inner.observable.observe(callback)
    }

    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        self.inner.observable.unobserve(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observable.len()
    }

    pub fn export(&self) -> Result<Value, ModelError> {
        self.inner.root.read().export()
    }

    pub fn export_at(&self, path: &[PathSegment]) -> Result<Value, ModelError> {
        self.read(path, Node::export)?
    }
}

/// A model handle anchored at `base` that tags its writes with `tag`. Sub-views
/// inherit the tag.
#[derive(Clone, Debug)]
pub struct ModelView {
    model: Model,
    base: Path,
    tag: Tag,
}

impl ModelView {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn base(&self) -> &[PathSegment] {
        &self.base
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn view(&self, relative: &[PathSegment]) -> ModelView {
        ModelView {
            model: self.model.clone(),
            base: self.resolve(relative),
            tag: self.tag.clone(),
        }
    }

    pub fn resolve(&self, relative: &[PathSegment]) -> Path {
        let mut path = self.base.clone();
        path.extend_from_slice(relative);
        path
    }

    pub fn get(&self, relative: &[PathSegment]) -> Result<Node, ModelError> {
        self.model.get(&self.resolve(relative))
    }

    pub fn set(&self, relative: &[PathSegment], value: impl Into<Node>) -> Result<(), ModelError> {
        self.model.set(&self.resolve(relative), value, &self.tag)
    }

    pub fn delete(&self, relative: &[PathSegment]) -> Result<Node, ModelError> {
        self.model.delete(&self.resolve(relative), &self.tag)
    }

    pub fn export(&self) -> Result<Value, ModelError> {
        self.model.export_at(&self.base)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
