use axum::{
    body::Bytes,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use shared::error::ApiError;
use tracing::{debug, warn};
use url::Url;

pub const GUEST_SCHEME: &str = "Guest ";
pub const MIN_GUEST_NAME_CHARS: usize = 2;

#[derive(Debug)]
pub enum ProxyError {
    MissingCredential(&'static str),
    Validation(&'static str),
    /// Non-2xx backend answer, relayed as is.
    Backend { status: StatusCode, body: Value },
    Transport(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::MissingCredential(message) => {
                (StatusCode::UNAUTHORIZED, Json(ApiError::new(message))).into_response()
            }
            ProxyError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(ApiError::new(message))).into_response()
            }
            ProxyError::Backend { status, body } => (status, Json(body)).into_response(),
            ProxyError::Transport(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("internal server error").with_details(details)),
            )
                .into_response(),
        }
    }
}

pub type Relayed = (StatusCode, Json<Value>);

/// Authorization value to attach to the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Anonymous,
    Bearer(String),
    Guest(String),
}

impl Upstream {
    fn header_value(&self) -> Option<String> {
        match self {
            Upstream::Anonymous => None,
            Upstream::Bearer(token) => Some(format!("Bearer {token}")),
            Upstream::Guest(token) => Some(format!("{GUEST_SCHEME}{token}")),
        }
    }
}

/// Takes the second word of the `Authorization` header, whatever the scheme.
pub fn bearer_token(headers: &HeaderMap) -> Result<Upstream, ProxyError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(' ').nth(1))
        .filter(|token| !token.is_empty())
        .map(|token| Upstream::Bearer(token.to_string()))
        .ok_or(ProxyError::MissingCredential("unauthorized"))
}

pub fn guest_token(headers: &HeaderMap) -> Result<Upstream, ProxyError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(GUEST_SCHEME))
        .filter(|token| !token.trim().is_empty())
        .map(|token| Upstream::Guest(token.to_string()))
        .ok_or(ProxyError::MissingCredential("guest token required"))
}

pub fn parse_json_body(body: &Bytes) -> Result<Value, ProxyError> {
    if body.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(body).map_err(|_| ProxyError::Validation("invalid JSON"))
}

pub fn validate_message_body(body: &Value) -> Result<(), ProxyError> {
    let conversation = body
        .get("conversationId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty());
    let content = body
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.trim().is_empty());
    match (conversation, content) {
        (Some(_), Some(_)) => Ok(()),
        _ => Err(ProxyError::Validation("conversationId and content are required")),
    }
}

pub fn validate_guest_name(body: &Value) -> Result<(), ProxyError> {
    let long_enough = body
        .get("guestName")
        .and_then(Value::as_str)
        .map(|name| name.trim().chars().count() >= MIN_GUEST_NAME_CHARS)
        .unwrap_or(false);
    if long_enough {
        Ok(())
    } else {
        Err(ProxyError::Validation(
            "guestName must have at least 2 characters",
        ))
    }
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("backend URL {base_url} cannot carry a path");
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, segments: &[&str], query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.set_query(query);
        url
    }

    pub async fn forward(
        &self,
        method: Method,
        url: Url,
        credential: &Upstream,
        body: Option<&Value>,
    ) -> Result<Relayed, ProxyError> {
        debug!(%method, %url, "forwarding to backend");
        let mut request = self.http.request(method, url.clone());
        if let Some(value) = credential.header_value() {
            request = request.header(header::AUTHORIZATION, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| {
            warn!(%url, %error, "backend request failed");
            ProxyError::Transport(error.to_string())
        })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ProxyError::Transport(error.to_string()))?;

        if !status.is_success() {
            let body = serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| {
                serde_json::json!({ "error": format!("backend error: {}", status.as_u16()) })
            });
            debug!(%url, status = status.as_u16(), "relaying backend error");
            return Err(ProxyError::Backend { status, body });
        }

        if bytes.is_empty() {
            return Ok((status, Json(Value::Null)));
        }
        let body = serde_json::from_slice::<Value>(&bytes)
            .map_err(|error| ProxyError::Transport(format!("backend sent invalid JSON: {error}")))?;
        Ok((status, Json(body)))
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
