//! HTTP error taxonomy
//!
//! Every variant carries a human-readable message and maps to one status
//! code. `MethodNotAllowed` is an `InvalidUsage` raised with 405, so error
//! handlers registered for `InvalidUsage` also see it.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidUsage(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("{0}")]
    ServerError(String),

    #[error("{message}")]
    FileNotFound {
        message: String,
        path: String,
        relative_url: String,
    },

    #[error("{0}")]
    RequestTimeout(String),

    #[error("{0}")]
    PayloadTooLarge(String),
}

impl HttpError {
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::NotFound(_) | HttpError::FileNotFound { .. } => 404,
            HttpError::InvalidUsage(_) => 400,
            HttpError::MethodNotAllowed(_) => 405,
            HttpError::ServerError(_) => 500,
            HttpError::RequestTimeout(_) => 408,
            HttpError::PayloadTooLarge(_) => 413,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::NotFound(_) => ErrorKind::NotFound,
            HttpError::InvalidUsage(_) | HttpError::MethodNotAllowed(_) => ErrorKind::InvalidUsage,
            HttpError::ServerError(_) => ErrorKind::ServerError,
            HttpError::FileNotFound { .. } => ErrorKind::FileNotFound,
            HttpError::RequestTimeout(_) => ErrorKind::RequestTimeout,
            HttpError::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HttpError::NotFound(m)
            | HttpError::InvalidUsage(m)
            | HttpError::MethodNotAllowed(m)
            | HttpError::ServerError(m)
            | HttpError::RequestTimeout(m)
            | HttpError::PayloadTooLarge(m) => m,
            HttpError::FileNotFound { message, .. } => message,
        }
    }
}

/// Key for the error handler registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidUsage,
    ServerError,
    FileNotFound,
    RequestTimeout,
    PayloadTooLarge,
    /// Any non-HTTP handler failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidUsage => "InvalidUsage",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}
