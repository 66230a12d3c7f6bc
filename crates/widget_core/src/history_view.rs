use anyhow::Context;
use model::{path, Model, ModelError, Node, Tag};
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    dispatcher::Action,
    error::WidgetError,
    history::{History, ListenerId},
    widget::Widget,
    STATE_KEY,
};

/// Companion widget whose `state` mirrors another widget's history as
/// `{ history: [...], active_index }` and whose `restore_state(i)` action moves the
/// target back to entry `i`.
pub struct HistoryView {
    widget: Widget,
    target: Widget,
    listener: ListenerId,
}

impl HistoryView {
    pub fn new(component_name: impl Into<String>, target: &Widget) -> Result<Self, WidgetError> {
        let widget = Widget::new(
            component_name,
            json!({}),
            json!({ "state": { "history": [], "active_index": -1 } }),
        )?;
        mirror(widget.model(), target.history());

        let view_model = widget.model().clone();
        let source = target.downgrade();
        let listener = target.history().on_change(move |_| {
            if let Some(target) = source.upgrade() {
                mirror(&view_model, target.history());
            }
        });

        let restore_target = target.clone();
        widget.define(
            "restore_state",
            Action::future(move |_, args| {
                let target = restore_target.clone();
                async move {
                    let index = args
                        .first()
                        .and_then(Value::as_i64)
                        .context("restore_state expects an integer index")?;
                    target.restore_state(index).await?;
                    target.flush().await;
                    Ok(())
                }
            }),
            false,
        )?;

        Ok(Self {
            widget,
            target: target.clone(),
            listener,
        })
    }

    pub fn widget(&self) -> &Widget {
        &self.widget
    }

    pub fn target(&self) -> &Widget {
        &self.target
    }
}

impl Drop for HistoryView {
    fn drop(&mut self) {
        self.target.history().off_change(self.listener);
    }
}

fn mirror(view_model: &Model, history: &History) {
    let mut exported = Vec::new();
    for (index, entry) in history.entries().iter().enumerate() {
        match entry.export() {
            Ok(value) => exported.push(value),
            Err(error) => {
                warn!(index, %error, "history entry cannot be exported; mirrored as null");
                exported.push(Value::Null);
            }
        }
    }
    let active = history.current_index().map_or(-1, |i| i as i64);
    let result = view_model.update(&[STATE_KEY.into()], &Tag::Backend, |state| {
        state.assign(&path!["history"], Node::from(Value::Array(exported)))?;
        state.assign(&path!["active_index"], Node::from(active))?;
        Ok::<_, ModelError>(())
    });
    if let Err(error) = result {
        warn!(%error, "history view state could not be updated");
    }
}

#[cfg(test)]
#[path = "tests/history_view_tests.rs"]
mod tests;
