use model::ModelError;
use shared::{domain::ClientId, error::ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no action named `{name}`")]
    NotFound { name: String },
    #[error("action `{name}` failed: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not snapshot state after `{name}`: {source}")]
    Snapshot {
        name: String,
        #[source]
        source: ModelError,
    },
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history index {index} out of range (length {len})")]
    OutOfRange { index: i64, len: usize },
    #[error("no earlier state to return to")]
    NoEarlierState,
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("client {0} is not attached")]
    UnknownClient(ClientId),
    #[error("client {0} is already attached")]
    AlreadyAttached(ClientId),
    #[error("widget model root must be a map, got a {kind}")]
    InvalidRoot { kind: &'static str },
}
