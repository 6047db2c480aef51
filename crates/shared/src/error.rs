use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON error body exchanged with the backend and returned by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Extracts the `error` field from a response body, if the body is an error object.
    pub fn message_from_body(body: &[u8]) -> Option<String> {
        let parsed: serde_json::Value = serde_json::from_slice(body).ok()?;
        parsed
            .get("error")
            .and_then(|value| value.as_str())
            .map(str::to_owned)
            .filter(|message| !message.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("payload is missing an identifier")]
    MissingId,
    #[error("message {0} has no sender")]
    MissingSender(String),
    #[error("message {0} has no conversation")]
    MissingConversation(String),
}
