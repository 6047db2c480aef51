use reqwest::StatusCode;
use shared::error::{ApiError, NormalizationError};
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No session, a session of the wrong kind, or a credential the backend refused.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Rejected locally; nothing was sent.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{message}")]
    Remote { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("client storage failed: {0}")]
    Storage(String),
}

impl ClientError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Maps a non-2xx backend response. The body's `error` field wins over the status template.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let message = ApiError::message_from_body(body)
            .unwrap_or_else(|| format!("backend returned HTTP {}", status.as_u16()));
        if status == StatusCode::UNAUTHORIZED {
            return Self::Unauthenticated(message);
        }
        Self::Remote {
            status: status.as_u16(),
            message,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Payload(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

impl From<NormalizationError> for ClientError {
    fn from(err: NormalizationError) -> Self {
        Self::Payload(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
