use std::{collections::HashMap, fs};

use serde::Deserialize;
use tracing::warn;

const PROXY_CONFIG_FILE: &str = "proxy.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    /// Backend root without the `/api` suffix.
    pub backend_url: String,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".into(),
            backend_url: "http://127.0.0.1:3002".into(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(PROXY_CONFIG_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("bind_addr").and_then(toml::Value::as_str) {
                    settings.bind_addr = v.to_string();
                }
                if let Some(v) = file_cfg.get("backend_url").and_then(toml::Value::as_str) {
                    settings.backend_url = v.to_string();
                }
                if let Some(v) = file_cfg
                    .get("max_body_bytes")
                    .and_then(toml::Value::as_integer)
                    .and_then(|v| usize::try_from(v).ok())
                {
                    settings.max_body_bytes = v;
                }
            }
            Err(error) => warn!(%error, file = PROXY_CONFIG_FILE, "ignoring unreadable config file"),
        }
    }

    if let Some(v) = env("PROXY_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__BACKEND_URL") {
        settings.backend_url = v;
    }

    if let Some(v) = env("APP__MAX_BODY_BYTES") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.max_body_bytes = parsed,
            Err(_) => warn!(value = %v, "APP__MAX_BODY_BYTES is not a number, keeping default"),
        }
    }

    settings.backend_url = normalize_backend_url(&settings.backend_url);
    settings
}

/// Accepts either the backend root or its `/api` base and returns the root.
pub fn normalize_backend_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let root = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return Settings::default().backend_url;
    }
    root.to_string()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
