//! Widget runtime: per-client message queues, remote calls, sequential actions and
//! recorded history on top of the observable [`model`] tree.

pub mod bridge;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod history_view;
pub mod render;
pub mod widget;

pub use bridge::{RemoteCallBridge, FUNCTION_NOT_FOUND};
pub use channel::{ChannelDetach, MessageChannel, Updater};
pub use dispatcher::{phase, Action, ActionContext, ActionDispatcher, DispatchOutcome, Phase};
pub use error::{DispatchError, HistoryError, WidgetError};
pub use history::{
    ActionDescriptor, History, HistoryEntry, HistoryEvent, HistoryStack, ListenerId,
};
pub use history_view::HistoryView;
pub use render::{Flusher, RenderHub};
pub use widget::{Attachment, ReceiverHandle, WeakWidget, Widget};

/// Root key holding the recorded, snapshotted state.
pub const STATE_KEY: &str = "state";
/// Root key holding the functions that dispatch actions.
pub const ACTIONS_KEY: &str = "actions";
