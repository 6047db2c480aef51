use std::{collections::HashMap, fs, time::Duration};

use tracing::warn;
use url::Url;

use crate::realtime::RetryPolicy;

const CLIENT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// REST root including the `/api` prefix.
    pub api_base_url: String,
    pub realtime_url: String,
    pub database_url: String,
    pub typing_idle_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub outbound_queue_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let api_base_url = "http://127.0.0.1:3002/api".to_string();
        let realtime_url = derive_realtime_url(&api_base_url)
            .unwrap_or_else(|| "ws://127.0.0.1:3002/ws".to_string());
        Self {
            api_base_url,
            realtime_url,
            database_url: "sqlite://./data/client.db".into(),
            typing_idle_ms: 1000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            outbound_queue_limit: 256,
        }
    }
}

impl ClientSettings {
    /// Points the client at another backend; the realtime URL follows unless `realtime_url` is given.
    pub fn with_api_base_url(
        mut self,
        api_base_url: impl Into<String>,
        realtime_url: Option<String>,
    ) -> Self {
        self.api_base_url = trim_trailing_slash(&api_base_url.into());
        self.realtime_url = realtime_url
            .or_else(|| derive_realtime_url(&self.api_base_url))
            .unwrap_or(self.realtime_url);
        self
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect_base_ms, self.reconnect_max_ms)
    }
}

pub fn load_client_settings() -> ClientSettings {
    let file = fs::read_to_string(CLIENT_CONFIG_FILE).ok();
    load_client_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `client.toml` table, then environment overrides.
pub fn load_client_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();
    let mut api_base_url = None;
    let mut realtime_url = None;

    if let Some(raw) = file_contents {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                let text = |key: &str| {
                    file_cfg.get(key).map(|value| match value {
                        toml::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                };
                if let Some(v) = text("api_url") {
                    api_base_url = Some(v);
                }
                if let Some(v) = text("realtime_url") {
                    realtime_url = Some(v);
                }
                if let Some(v) = text("database_url") {
                    settings.database_url = v;
                }
                apply_number(&mut settings.typing_idle_ms, text("typing_idle_ms"));
                apply_number(&mut settings.reconnect_base_ms, text("reconnect_base_ms"));
                apply_number(&mut settings.reconnect_max_ms, text("reconnect_max_ms"));
                apply_number(
                    &mut settings.outbound_queue_limit,
                    text("outbound_queue_limit"),
                );
            }
            Err(err) => warn!(error = %err, "ignoring unreadable {CLIENT_CONFIG_FILE}"),
        }
    }

    for key in ["CHAT_API_URL", "APP__API_URL"] {
        if let Some(v) = env(key) {
            api_base_url = Some(v);
        }
    }
    for key in ["CHAT_REALTIME_URL", "APP__REALTIME_URL"] {
        if let Some(v) = env(key) {
            realtime_url = Some(v);
        }
    }
    for key in ["CHAT_DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    apply_number(&mut settings.typing_idle_ms, env("APP__TYPING_IDLE_MS"));

    match api_base_url {
        Some(api_base_url) => settings.with_api_base_url(api_base_url, realtime_url),
        None => {
            if let Some(realtime_url) = realtime_url {
                settings.realtime_url = realtime_url;
            }
            settings
        }
    }
}

/// `http://host:port/api` becomes `ws://host:port/ws`; `https` maps to `wss`.
pub fn derive_realtime_url(api_base_url: &str) -> Option<String> {
    let mut url = Url::parse(api_base_url).ok()?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Some(url.to_string()),
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

fn apply_number<T: std::str::FromStr>(target: &mut T, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(value = %raw, "ignoring non-numeric client setting"),
    }
}

fn trim_trailing_slash(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
