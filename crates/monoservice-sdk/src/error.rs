//! Error type for handler internals
//!
//! `Handler::process` has no error channel: a failure has to travel inside
//! the `Response`. `HandlerError` lets module code use `?` internally and
//! convert at the end.

use thiserror::Error;

use crate::Response;

/// Errors a handler may raise while servicing a request
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found")]
    NotFound,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Convert the error to an HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_) => 400,
            HandlerError::Unauthorized(_) => 401,
            HandlerError::NotFound => 404,
            HandlerError::ServiceUnavailable(_) => 503,
            HandlerError::Serialization(_) | HandlerError::Internal(_) => 500,
        }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.status_code(), self.to_string())
    }
}

impl From<HandlerError> for Response {
    fn from(err: HandlerError) -> Self {
        err.into_response()
    }
}
