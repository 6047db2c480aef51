use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::{
    bearer_token, guest_token, parse_json_body, validate_guest_name, validate_message_body,
    BackendClient, ProxyError, Relayed, Upstream,
};
use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let backend = BackendClient::new(&settings.backend_url)?;
    info!(backend = %backend.base_url(), "forwarding API routes");

    let state = AppState { backend };
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "proxy listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/conversations/guest", get(guest_conversations))
        .route("/api/conversations/:id/messages", get(conversation_messages))
        .route(
            "/api/messages/conversation/:id/guest",
            get(guest_conversation_messages),
        )
        .route("/api/messages", post(send_message))
        .route("/api/messages/guest", post(send_guest_message))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", get(get_group).put(update_group))
        .route("/api/groups/:id/members", post(add_group_members))
        .route("/api/invite/generate", post(generate_invite))
        .route("/api/invite/verify/:token", get(verify_invite))
        .route("/api/invite/join/:token", post(join_invite))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn guest_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Relayed, ProxyError> {
    let credential = guest_token(&headers)?;
    let url = state
        .backend
        .endpoint(&["api", "conversations", "guest"], None);
    state.backend.forward(Method::GET, url, &credential, None).await
}

async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Relayed, ProxyError> {
    let credential = bearer_token(&headers)?;
    let url = state
        .backend
        .endpoint(&["api", "messages", "conversation", id.as_str()], None);
    state.backend.forward(Method::GET, url, &credential, None).await
}

async fn guest_conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Relayed, ProxyError> {
    let credential = guest_token(&headers)?;
    let url = state
        .backend
        .endpoint(&["api", "messages", "conversation", id.as_str(), "guest"], None);
    state.backend.forward(Method::GET, url, &credential, None).await
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    let credential = bearer_token(&headers)?;
    let body = parse_json_body(&body)?;
    validate_message_body(&body)?;
    let url = state.backend.endpoint(&["api", "messages"], None);
    state
        .backend
        .forward(Method::POST, url, &credential, Some(&body))
        .await
}

async fn send_guest_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    let credential = guest_token(&headers)?;
    let body = parse_json_body(&body)?;
    validate_message_body(&body)?;
    let url = state.backend.endpoint(&["api", "messages", "guest"], None);
    state
        .backend
        .forward(Method::POST, url, &credential, Some(&body))
        .await
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Relayed, ProxyError> {
    let credential = bearer_token(&headers)?;
    let url = state
        .backend
        .endpoint(&["api", "conversations"], Some("type=group"));
    state.backend.forward(Method::GET, url, &credential, None).await
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    forward_with_body(&state, &headers, Method::POST, &["api", "groups"], &body).await
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Relayed, ProxyError> {
    let credential = bearer_token(&headers)?;
    let url = state.backend.endpoint(&["api", "groups", id.as_str()], None);
    state.backend.forward(Method::GET, url, &credential, None).await
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    forward_with_body(&state, &headers, Method::PUT, &["api", "groups", id.as_str()], &body).await
}

async fn add_group_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    forward_with_body(
        &state,
        &headers,
        Method::POST,
        &["api", "groups", id.as_str(), "members"],
        &body,
    )
    .await
}

async fn generate_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    forward_with_body(
        &state,
        &headers,
        Method::POST,
        &["api", "invite", "generate"],
        &body,
    )
    .await
}

async fn verify_invite(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Relayed, ProxyError> {
    let url = state
        .backend
        .endpoint(&["api", "invite", "verify", token.as_str()], None);
    state
        .backend
        .forward(Method::GET, url, &Upstream::Anonymous, None)
        .await
}

async fn join_invite(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<Relayed, ProxyError> {
    let body = parse_json_body(&body)?;
    validate_guest_name(&body)?;
    let url = state
        .backend
        .endpoint(&["api", "invite", "join", token.as_str()], None);
    state
        .backend
        .forward(Method::POST, url, &Upstream::Anonymous, Some(&body))
        .await
}

async fn forward_with_body(
    state: &AppState,
    headers: &HeaderMap,
    method: Method,
    segments: &[&str],
    body: &Bytes,
) -> Result<Relayed, ProxyError> {
    let credential = bearer_token(headers)?;
    let body = parse_json_body(body)?;
    let url = state.backend.endpoint(segments, None);
    state
        .backend
        .forward(method, url, &credential, Some(&body))
        .await
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
