use indexmap::IndexMap;
use widget_core::{HistoryView, Widget, WidgetError};

use crate::{config::Settings, demo::counter_widget};

/// Widgets hosted by this process, addressed by name.
pub(crate) struct AppState {
    widgets: IndexMap<String, Widget>,
    // Kept alive so their history listeners stay registered.
    history_views: Vec<HistoryView>,
    pub(crate) render_buffer: usize,
}

impl AppState {
    pub(crate) fn new(render_buffer: usize) -> Self {
        Self {
            widgets: IndexMap::new(),
            history_views: Vec::new(),
            render_buffer,
        }
    }

    /// Hosts the counter widget under `settings.component_name` and its history view
    /// under `<name>_history`.
    pub(crate) fn with_demo(settings: &Settings) -> Result<Self, WidgetError> {
        let mut state = Self::new(settings.render_buffer);
        let counter = counter_widget(&settings.component_name)?;
        let history_name = format!("{}_history", settings.component_name);
        let view = HistoryView::new(history_name.clone(), &counter)?;
        state.register(settings.component_name.clone(), counter);
        state.register(history_name, view.widget().clone());
        state.history_views.push(view);
        Ok(state)
    }

    pub(crate) fn register(&mut self, name: impl Into<String>, widget: Widget) {
        self.widgets.insert(name.into(), widget);
    }

    pub(crate) fn widget(&self, name: &str) -> Option<&Widget> {
        self.widgets.get(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.widgets.keys().cloned().collect()
    }
}
