use std::{collections::HashMap, fs};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    /// Name the demo counter widget is hosted under; its history view gets a `_history` suffix.
    pub component_name: String,
    /// Rendered frames a connection may queue before rendering waits on the socket.
    pub render_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8765".into(),
            component_name: "counter".into(),
            render_buffer: 16,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, String>>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(error) => {
            warn!(%error, "ignoring unreadable server.toml");
            return;
        }
    };
    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = file_cfg.get("component_name") {
        settings.component_name = v.clone();
    }
    if let Some(v) = file_cfg.get("render_buffer") {
        set_render_buffer(settings, v);
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("APP__COMPONENT_NAME") {
        settings.component_name = v;
    }

    if let Some(v) = var("APP__RENDER_BUFFER") {
        set_render_buffer(settings, &v);
    }
}

fn set_render_buffer(settings: &mut Settings, raw: &str) {
    match raw.parse::<usize>() {
        Ok(parsed) if parsed > 0 => settings.render_buffer = parsed,
        _ => warn!(value = %raw, "render_buffer must be a positive integer; keeping {}", settings.render_buffer),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
