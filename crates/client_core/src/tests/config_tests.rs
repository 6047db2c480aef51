use super::*;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn defaults_match_local_backend() {
    let settings = load_client_settings_from(None, no_env);
    assert_eq!(settings.api_base_url, "http://127.0.0.1:3002/api");
    assert_eq!(settings.realtime_url, "ws://127.0.0.1:3002/ws");
    assert_eq!(settings.typing_idle(), Duration::from_millis(1000));
    assert_eq!(settings.outbound_queue_limit, 256);
}

#[test]
fn realtime_url_follows_api_url() {
    assert_eq!(
        derive_realtime_url("https://chat.example.com/api").as_deref(),
        Some("wss://chat.example.com/ws")
    );
    assert_eq!(
        derive_realtime_url("http://10.0.0.15:3002/api?debug=1").as_deref(),
        Some("ws://10.0.0.15:3002/ws")
    );
    assert_eq!(derive_realtime_url("ftp://example.com"), None);
}

#[test]
fn file_values_apply_before_environment() {
    let file = r#"
api_url = "http://files.local:4000/api/"
database_url = "sqlite::memory:"
typing_idle_ms = 750
"#;
    let settings = load_client_settings_from(Some(file), |key| match key {
        "APP__TYPING_IDLE_MS" => Some("1200".into()),
        _ => None,
    });

    assert_eq!(settings.api_base_url, "http://files.local:4000/api");
    assert_eq!(settings.realtime_url, "ws://files.local:4000/ws");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.typing_idle_ms, 1200);
}

#[test]
fn explicit_realtime_url_wins_over_derivation() {
    let settings = load_client_settings_from(None, |key| match key {
        "CHAT_API_URL" => Some("http://api.local/api".into()),
        "APP__REALTIME_URL" => Some("ws://push.local:9000/socket".into()),
        _ => None,
    });
    assert_eq!(settings.api_base_url, "http://api.local/api");
    assert_eq!(settings.realtime_url, "ws://push.local:9000/socket");
}

#[test]
fn malformed_numbers_keep_defaults() {
    let settings = load_client_settings_from(Some("typing_idle_ms = \"soon\""), no_env);
    assert_eq!(settings.typing_idle_ms, 1000);
}
