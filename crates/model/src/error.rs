use shared::domain::PathSegment;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("no value at `{path}`")]
    NotFound { path: String },
    #[error("path must name at least one segment")]
    EmptyPath,
    #[error("segment `{segment}` cannot index the {container} at `{path}`")]
    InvalidSegment {
        path: String,
        segment: String,
        container: &'static str,
    },
    #[error("{kind} at `{path}` is not a container")]
    NotAContainer { path: String, kind: &'static str },
    #[error("tuple at `{path}` is immutable")]
    Immutable { path: String },
    #[error("cannot export data of type {type_name} at `{path}`")]
    Serialization { path: String, type_name: String },
}

impl ModelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ModelError::NotFound { .. })
    }
}

/// Renders a path as `/state/items/0`; the root is `/`.
pub fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|segment| format!("/{segment}")).collect()
}
