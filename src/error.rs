use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    MultiplexerUnavailable,
    SessionCreateFailed,
    SpawnFailed,
    IoError,
    ConnectionClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TermError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApiError> for TermError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl From<axum::Error> for TermError {
    fn from(value: axum::Error) -> Self {
        ApiError::new(ErrorCode::ConnectionClosed, "WebSocket error")
            .with_details(value.to_string())
            .into()
    }
}

impl From<futures::channel::mpsc::SendError> for TermError {
    fn from(value: futures::channel::mpsc::SendError) -> Self {
        ApiError::new(ErrorCode::ConnectionClosed, "Connection channel closed")
            .with_details(value.to_string())
            .into()
    }
}

impl TermError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TermError::Api(api) => api.error_code.clone(),
            TermError::Io(_) => ErrorCode::IoError,
            TermError::Json(_) => ErrorCode::InvalidArgument,
        }
    }

    pub fn client_text(&self) -> String {
        match self {
            TermError::Api(api) => api.details.clone().unwrap_or_else(|| api.message.clone()),
            other => other.to_string(),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::MultiplexerUnavailable => "MULTIPLEXER_UNAVAILABLE",
            ErrorCode::SessionCreateFailed => "SESSION_CREATE_FAILED",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TermResult<T> = Result<T, TermError>;
