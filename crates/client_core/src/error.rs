use thiserror::Error;

/// Error description returned by the backend for a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote call failed: {0}")]
pub struct RemoteError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no render frame received yet")]
    NotConnected,
    #[error("model path must not be empty")]
    EmptyPath,
    #[error("model path {path} does not exist locally")]
    InvalidPath { path: String },
}
