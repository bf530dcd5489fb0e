//! Application handler contract and error responses
//!
//! A handler receives the parsed request and resolves to a response or a
//! [`HandlerError`]. Errors are turned into responses by an
//! [`ErrorHandler`], which looks up a responder registered for the error's
//! kind and falls back to a plain-text default.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use coop_core::SchedError;
use thiserror::Error;

use crate::error::{ErrorKind, HttpError};
use crate::request::Request;
use crate::response::{text, Response};

const GENERIC_ERROR: &str = "An error occurred while generating the request";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The handler task was cancelled; never turned into a response
    #[error("handler cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(anyhow::Error),
}

impl HandlerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            HandlerError::Http(e) => Some(e.kind()),
            HandlerError::Internal(_) => Some(ErrorKind::Internal),
            HandlerError::Cancelled => None,
        }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Internal(err.into())
    }
}

impl From<SchedError> for HandlerError {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::Cancelled => HandlerError::Cancelled,
            other => HandlerError::Internal(other.into()),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Internal(e)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Internal(e.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Internal(e.into())
    }
}

pub type HandlerResult = Result<Response, HandlerError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult>>>;

/// Turns a request into a response
///
/// Implemented for closures `Fn(Rc<Request>) -> impl Future<Output =
/// HandlerResult>`.
pub trait RequestHandler {
    fn handle(&self, request: Rc<Request>) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Rc<Request>) -> Fut,
    Fut: Future<Output = HandlerResult> + 'static,
{
    fn handle(&self, request: Rc<Request>) -> HandlerFuture {
        Box::pin(self(request))
    }
}

pub type ErrorResponder = Box<dyn Fn(Option<&Request>, &HandlerError) -> Response>;

/// Error handler registry
pub struct ErrorHandler {
    handlers: HashMap<ErrorKind, ErrorResponder>,
    debug: bool,
}

impl ErrorHandler {
    /// With `debug` set, internal errors show their cause chain
    pub fn new(debug: bool) -> Self {
        Self {
            handlers: HashMap::new(),
            debug,
        }
    }

    /// Use `responder` for every error of `kind`
    pub fn add<F>(&mut self, kind: ErrorKind, responder: F)
    where
        F: Fn(Option<&Request>, &HandlerError) -> Response + 'static,
    {
        self.handlers.insert(kind, Box::new(responder));
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Response for `error`, or `None` for a cancellation
    pub fn response(&self, request: Option<&Request>, error: &HandlerError) -> Option<Response> {
        let kind = error.kind()?;
        Some(match self.handlers.get(&kind) {
            Some(responder) => responder(request, error),
            None => self.default_response(error),
        })
    }

    pub fn default_response(&self, error: &HandlerError) -> Response {
        match error {
            HandlerError::Http(e) => text(format!("Error: {}", e)).with_status(e.status_code()),
            HandlerError::Internal(e) if self.debug => {
                text(format!("Error: {}\nException: {:?}", e, e)).with_status(500)
            }
            _ => text(GENERIC_ERROR).with_status(500),
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .field("debug", &self.debug)
            .finish()
    }
}
