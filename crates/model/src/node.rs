use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::{Map, Number, Value};
use shared::domain::PathSegment;

use crate::error::{display_path, ModelError};

pub type CallResult = anyhow::Result<Value>;

type SyncFn = dyn Fn(Vec<Value>) -> CallResult + Send + Sync;
type AsyncFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, CallResult> + Send + Sync;

/// Backend function stored in the model and callable by remote clients.
#[derive(Clone)]
pub enum ModelFunction {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl ModelFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| f(args).boxed()))
    }

    /// Runs the function, awaiting it when asynchronous. Panics are not caught here.
    pub async fn invoke(&self, args: Vec<Value>) -> CallResult {
        match self {
            Self::Sync(f) => f(args),
            Self::Async(f) => f(args).await,
        }
    }

    /// Like [`invoke`](Self::invoke) but turns a panic inside the function into an error.
    pub async fn invoke_caught(&self, args: Vec<Value>) -> CallResult {
        let outcome = match self {
            Self::Sync(f) => {
                let f = Arc::clone(f);
                std::panic::catch_unwind(AssertUnwindSafe(move || f(args)))
            }
            Self::Async(f) => AssertUnwindSafe(f(args)).catch_unwind().await,
        };
        outcome.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic)))
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Sync(a), Self::Sync(b)) => Arc::ptr_eq(a, b),
            (Self::Async(a), Self::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Debug for ModelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("ModelFunction::Sync"),
            Self::Async(_) => f.write_str("ModelFunction::Async"),
        }
    }
}

/// Host value with no transfer representation. Stored as-is; `export` rejects it.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

/// A node of the model tree. Cloning a node deep-copies every container below it;
/// functions and opaque values are shared handles.
#[derive(Debug, Clone, Default)]
pub enum Node {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Str(String),
    Map(IndexMap<String, Node>),
    Sequence(Vec<Node>),
    Tuple(Vec<Node>),
    Function(ModelFunction),
    Opaque(Opaque),
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Node::Null, Node::Null) => true,
            (Node::Bool(a), Node::Bool(b)) => a == b,
            (Node::Int(a), Node::Int(b)) => a == b,
            (Node::Float(a), Node::Float(b)) => a == b,
            (Node::UInt(a), Node::UInt(b)) => a == b,
            (Node::Int(a), Node::UInt(b)) | (Node::UInt(b), Node::Int(a)) => {
                u64::try_from(*a).is_ok_and(|a| a == *b)
            }
            (Node::Int(a), Node::Float(b)) | (Node::Float(b), Node::Int(a)) => (*a as f64) == *b,
            (Node::UInt(a), Node::Float(b)) | (Node::Float(b), Node::UInt(a)) => (*a as f64) == *b,
            (Node::Str(a), Node::Str(b)) => a == b,
            (Node::Map(a), Node::Map(b)) => a == b,
            (Node::Sequence(a), Node::Sequence(b)) => a == b,
            (Node::Tuple(a), Node::Tuple(b)) => a == b,
            (Node::Function(a), Node::Function(b)) => a.ptr_eq(b),
            (Node::Opaque(a), Node::Opaque(b)) => Arc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl Node {
    pub fn empty_map() -> Self {
        Node::Map(IndexMap::new())
    }

    pub fn map<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Node>,
    {
        Node::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn tuple<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Node>,
    {
        Node::Tuple(items.into_iter().map(Into::into).collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Null => "null",
            Node::Bool(_) => "bool",
            Node::Int(_) | Node::UInt(_) | Node::Float(_) => "number",
            Node::Str(_) => "string",
            Node::Map(_) => "map",
            Node::Sequence(_) => "sequence",
            Node::Tuple(_) => "tuple",
            Node::Function(_) => "function",
            Node::Opaque(_) => "opaque",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Node::Map(_) | Node::Sequence(_) | Node::Tuple(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            Node::UInt(u) => i64::try_from(*u).ok(),
            Node::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Node::Int(i) => Some(*i as f64),
            Node::UInt(u) => Some(*u as f64),
            Node::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Node>> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ModelFunction> {
        match self {
            Node::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Map(m) => m.len(),
            Node::Sequence(items) | Node::Tuple(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn child(&self, segment: &PathSegment, at: &[PathSegment]) -> Result<&Node, ModelError> {
        let child = match (self, segment) {
            (Node::Map(m), PathSegment::Key(k)) => m.get(k),
            (Node::Sequence(items) | Node::Tuple(items), PathSegment::Index(i)) => items.get(*i),
            (container, _) => return Err(Self::bad_segment(container, segment, at)),
        };
        child.ok_or_else(|| not_found(at, segment))
    }

    fn child_mut(
        &mut self,
        segment: &PathSegment,
        at: &[PathSegment],
    ) -> Result<&mut Node, ModelError> {
        let child = match (self, segment) {
            (Node::Map(m), PathSegment::Key(k)) => m.get_mut(k),
            (Node::Sequence(items) | Node::Tuple(items), PathSegment::Index(i)) => {
                items.get_mut(*i)
            }
            (container, _) => return Err(Self::bad_segment(container, segment, at)),
        };
        child.ok_or_else(|| not_found(at, segment))
    }

    fn bad_segment(container: &Node, segment: &PathSegment, at: &[PathSegment]) -> ModelError {
        if container.is_container() {
            ModelError::InvalidSegment {
                path: display_path(at),
                segment: segment.to_string(),
                container: container.kind(),
            }
        } else {
            ModelError::NotAContainer {
                path: display_path(at),
                kind: container.kind(),
            }
        }
    }

    pub fn lookup(&self, path: &[PathSegment]) -> Result<&Node, ModelError> {
        let mut node = self;
        for (depth, segment) in path.iter().enumerate() {
            node = node.child(segment, &path[..depth])?;
        }
        Ok(node)
    }

    pub fn lookup_mut(&mut self, path: &[PathSegment]) -> Result<&mut Node, ModelError> {
        let mut node = self;
        for (depth, segment) in path.iter().enumerate() {
            node = node.child_mut(segment, &path[..depth])?;
        }
        Ok(node)
    }

    /// Assigns `value` at `path`, which must name at least one segment. Map keys may be
    /// new; sequence indices must already exist.
    pub fn assign(&mut self, path: &[PathSegment], value: Node) -> Result<(), ModelError> {
        let (last, parent_path) = path.split_last().ok_or(ModelError::EmptyPath)?;
        let parent = self.lookup_mut(parent_path)?;
        match (parent, last) {
            (Node::Map(m), PathSegment::Key(k)) => {
                m.insert(k.clone(), value);
                Ok(())
            }
            (Node::Sequence(items), PathSegment::Index(i)) => match items.get_mut(*i) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(not_found(parent_path, last)),
            },
            (Node::Tuple(_), _) => Err(ModelError::Immutable {
                path: display_path(parent_path),
            }),
            (container, _) => Err(Self::bad_segment(container, last, parent_path)),
        }
    }

    /// Removes and returns the value at `path`. Sequence elements after it shift down.
    pub fn remove(&mut self, path: &[PathSegment]) -> Result<Node, ModelError> {
        let (last, parent_path) = path.split_last().ok_or(ModelError::EmptyPath)?;
        let parent = self.lookup_mut(parent_path)?;
        match (parent, last) {
            (Node::Map(m), PathSegment::Key(k)) => {
                m.shift_remove(k).ok_or_else(|| not_found(parent_path, last))
            }
            (Node::Sequence(items), PathSegment::Index(i)) if *i < items.len() => {
                Ok(items.remove(*i))
            }
            (Node::Sequence(_), PathSegment::Index(_)) => Err(not_found(parent_path, last)),
            (Node::Tuple(_), _) => Err(ModelError::Immutable {
                path: display_path(parent_path),
            }),
            (container, _) => Err(Self::bad_segment(container, last, parent_path)),
        }
    }

    /// Serializes to a transfer-safe JSON tree. Functions become `{"type": "function"}`.
    pub fn export(&self) -> Result<Value, ModelError> {
        let mut path = Vec::new();
        self.export_at(&mut path)
    }

    fn export_at(&self, path: &mut Vec<PathSegment>) -> Result<Value, ModelError> {
        Ok(match self {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Int(i) => Value::Number((*i).into()),
            Node::UInt(u) => Value::Number((*u).into()),
            Node::Float(f) => Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
                ModelError::Serialization {
                    path: display_path(path),
                    type_name: format!("non-finite float ({f})"),
                }
            })?,
            Node::Str(s) => Value::String(s.clone()),
            Node::Map(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (key, child) in entries {
                    path.push(PathSegment::Key(key.clone()));
                    let exported = child.export_at(path);
                    path.pop();
                    out.insert(key.clone(), exported?);
                }
                Value::Object(out)
            }
            Node::Sequence(items) | Node::Tuple(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, child) in items.iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    let exported = child.export_at(path);
                    path.pop();
                    out.push(exported?);
                }
                Value::Array(out)
            }
            Node::Function(_) => serde_json::json!({ "type": "function" }),
            Node::Opaque(opaque) => {
                return Err(ModelError::Serialization {
                    path: display_path(path),
                    type_name: opaque.type_name().to_string(),
                })
            }
        })
    }
}

fn not_found(parent_path: &[PathSegment], segment: &PathSegment) -> ModelError {
    let mut full = parent_path.to_vec();
    full.push(segment.clone());
    ModelError::NotFound {
        path: display_path(&full),
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Int(i),
                None => match n.as_u64() {
                    Some(u) => Node::UInt(u),
                    None => Node::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
            },
            Value::String(s) => Node::Str(s),
            Value::Array(items) => Node::Sequence(items.into_iter().map(Node::from).collect()),
            Value::Object(entries) => Node::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Node::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Int(value)
    }
}

impl From<i32> for Node {
    fn from(value: i32) -> Self {
        Node::Int(value.into())
    }
}

impl From<u64> for Node {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Node::UInt(value), Node::Int)
    }
}

impl From<usize> for Node {
    fn from(value: usize) -> Self {
        Node::from(value as u64)
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Float(value)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Str(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Str(value)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::Sequence(value)
    }
}

impl From<IndexMap<String, Node>> for Node {
    fn from(value: IndexMap<String, Node>) -> Self {
        Node::Map(value)
    }
}

impl From<ModelFunction> for Node {
    fn from(value: ModelFunction) -> Self {
        Node::Function(value)
    }
}

impl From<Opaque> for Node {
    fn from(value: Opaque) -> Self {
        Node::Opaque(value)
    }
}

impl<T: Into<Node>> From<Option<T>> for Node {
    fn from(value: Option<T>) -> Self {
        value.map_or(Node::Null, Into::into)
    }
}
