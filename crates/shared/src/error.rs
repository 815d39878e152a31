use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

/// Structured error body returned by the backend for non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Client-side error taxonomy.
///
/// Every transport, codec, or server failure is converted into one of these
/// variants at the boundary; raw library errors never escape to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("server error {:?}: {}", .0.code, .0.message)]
    Server(ApiError),
    #[error("server returned an error without a decodable body")]
    NoErrorBody,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("parse failure: {0}")]
    Parse(String),
}

impl ChatError {
    /// Permanent failures must not be retried; retrying cannot change the
    /// outcome (bad credentials, malformed input, undecodable payloads).
    pub fn is_permanent(&self) -> bool {
        match self {
            ChatError::Network(_) | ChatError::NoErrorBody => false,
            ChatError::Validation(_) | ChatError::Parse(_) => true,
            ChatError::Server(api) => matches!(
                api.code,
                ErrorCode::Unauthorized
                    | ErrorCode::Forbidden
                    | ErrorCode::NotFound
                    | ErrorCode::Validation
            ),
        }
    }

    pub fn is_temporary(&self) -> bool {
        !self.is_permanent()
    }

    pub fn network(message: impl Into<String>) -> Self {
        ChatError::Network(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ChatError::Parse(message.into())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        ChatError::Parse(value.to_string())
    }
}
