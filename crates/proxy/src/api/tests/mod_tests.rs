use super::*;
use axum::http::HeaderValue;
use serde_json::json;

fn headers_with(authorization: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(authorization).expect("header value"),
    );
    headers
}

#[test]
fn bearer_token_takes_second_word() {
    assert_eq!(
        bearer_token(&headers_with("Bearer abc123")).expect("token"),
        Upstream::Bearer("abc123".into())
    );
    assert!(matches!(
        bearer_token(&headers_with("Bearer")),
        Err(ProxyError::MissingCredential(_))
    ));
    assert!(matches!(
        bearer_token(&HeaderMap::new()),
        Err(ProxyError::MissingCredential(_))
    ));
}

#[test]
fn guest_token_requires_guest_scheme() {
    assert_eq!(
        guest_token(&headers_with("Guest g-77")).expect("guest"),
        Upstream::Guest("g-77".into())
    );
    assert!(guest_token(&headers_with("Bearer g-77")).is_err());
    assert!(guest_token(&headers_with("Guest ")).is_err());
}

#[test]
fn message_body_needs_conversation_and_visible_content() {
    assert!(validate_message_body(&json!({"conversationId": "c1", "content": "hola"})).is_ok());
    assert!(validate_message_body(&json!({"conversationId": "c1", "content": "  \n"})).is_err());
    assert!(validate_message_body(&json!({"content": "hola"})).is_err());
    assert!(validate_message_body(&json!({"conversationId": "", "content": "hola"})).is_err());
}

#[test]
fn guest_name_is_trimmed_before_counting() {
    assert!(validate_guest_name(&json!({"guestName": "Jo"})).is_ok());
    assert!(validate_guest_name(&json!({"guestName": "ñu"})).is_ok());
    assert!(validate_guest_name(&json!({"guestName": " J  "})).is_err());
    assert!(validate_guest_name(&json!({})).is_err());
}

#[test]
fn invalid_json_body_is_a_validation_error() {
    assert!(matches!(
        parse_json_body(&Bytes::from_static(b"{nope")),
        Err(ProxyError::Validation("invalid JSON"))
    ));
    assert_eq!(parse_json_body(&Bytes::new()).expect("empty"), json!({}));
}

#[test]
fn endpoint_appends_segments_to_backend_root() {
    let client = BackendClient::new("http://10.0.0.15:3002").expect("client");
    assert_eq!(
        client
            .endpoint(&["api", "messages", "conversation", "c 1"], None)
            .as_str(),
        "http://10.0.0.15:3002/api/messages/conversation/c%201"
    );
    assert_eq!(
        client
            .endpoint(&["api", "conversations"], Some("type=group"))
            .as_str(),
        "http://10.0.0.15:3002/api/conversations?type=group"
    );
}

#[test]
fn rejects_unusable_backend_urls() {
    assert!(BackendClient::new("not a url").is_err());
    assert!(BackendClient::new("mailto:ops@example.com").is_err());
}

#[test]
fn errors_map_to_status_codes() {
    assert_eq!(
        ProxyError::MissingCredential("unauthorized").into_response().status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        ProxyError::Validation("invalid JSON").into_response().status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        ProxyError::Backend {
            status: StatusCode::FORBIDDEN,
            body: json!({"error": "no"}),
        }
        .into_response()
        .status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        ProxyError::Transport("refused".into()).into_response().status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
