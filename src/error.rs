use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

/// Coarse classification callers use to decide between "try again" and a hard stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    Persistence,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("a review batch must hold between 1 and {max} topics, got {got}")]
    InvalidBatchSize { got: usize, max: usize },

    #[error("topic {0} appears more than once in the batch")]
    DuplicateTopic(String),

    #[error("answer must not be empty")]
    EmptyAnswer,

    #[error("topic title must not be empty")]
    EmptyTitle,

    #[error("session {0} is already completed")]
    SessionCompleted(String),

    #[error("session expects an answer for topic {expected}, got {got}")]
    TopicMismatch { expected: String, got: String },

    #[error("session {0} has no question waiting for an answer")]
    NoPendingQuestion(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("topic {0} not found")]
    TopicNotFound(String),

    #[error("session {0} was changed by another request")]
    Conflict(String),

    #[error("topic {0} was rescheduled by another request")]
    TopicConflict(String),

    #[error("question source failed: {0}")]
    QuestionSource(String),

    #[error("answer evaluator failed: {0}")]
    Evaluator(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Corrupt(e.to_string())
    }
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidBatchSize { .. }
            | VaultError::DuplicateTopic(_)
            | VaultError::EmptyAnswer
            | VaultError::EmptyTitle
            | VaultError::SessionCompleted(_)
            | VaultError::TopicMismatch { .. }
            | VaultError::NoPendingQuestion(_) => ErrorKind::Validation,
            VaultError::SessionNotFound(_) | VaultError::TopicNotFound(_) => ErrorKind::NotFound,
            VaultError::Conflict(_) | VaultError::TopicConflict(_) => ErrorKind::Conflict,
            VaultError::QuestionSource(_) | VaultError::Evaluator(_) | VaultError::Timeout { .. } => {
                ErrorKind::Upstream
            }
            VaultError::Database(_) | VaultError::Corrupt(_) => ErrorKind::Persistence,
        }
    }

    /// External-service failures are worth retrying as-is. So is a lost topic
    /// race: the session did not move, and a resubmission reads the fresh schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::TopicConflict(_)) || self.kind() == ErrorKind::Upstream
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VaultError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => match self.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&VaultError> for ErrorBody {
    fn from(e: &VaultError) -> Self {
        ErrorBody {
            error: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        if self.kind() == ErrorKind::Persistence {
            log::error!("{}", self);
        }
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}
