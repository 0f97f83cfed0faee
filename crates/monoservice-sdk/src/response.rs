//! Outbound response shape returned by `Handler::process`

use serde::{Deserialize, Serialize};

/// A JSON response produced by a handler.
///
/// The host writes `json_content` verbatim as the body, with
/// `Content-Type: application/json` and `code` as the status.
///
/// | Method | Status |
/// |--------|--------|
/// | `ok(body)` | 200 |
/// | `bad_request(msg)` | 400 |
/// | `not_found()` | 404 |
/// | `internal_error(msg)` | 500 |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code
    pub code: u16,

    /// Body, already serialized as JSON
    pub json_content: String,
}

impl Response {
    /// Create a response from an already serialized JSON string.
    ///
    /// # Example
    /// ```ignore
    /// Response::raw(200, r#"{"message":"hello from the plugin"}"#)
    /// ```
    pub fn raw(code: u16, json_content: impl Into<String>) -> Self {
        Self {
            code,
            json_content: json_content.into(),
        }
    }

    /// Create a JSON response with a custom status code.
    pub fn json<T: Serialize>(code: u16, body: T) -> Self {
        match serde_json::to_string(&body) {
            Ok(json_content) => Self { code, json_content },
            Err(e) => Self::internal_error(format!("Failed to serialize response: {}", e)),
        }
    }

    /// Create a 200 OK response with JSON body.
    pub fn ok<T: Serialize>(body: T) -> Self {
        Self::json(200, body)
    }

    /// `{"error": message}` with the given status.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::json(code, serde_json::json!({"error": message.into()}))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error(400, message)
    }

    pub fn not_found() -> Self {
        Self::error(404, "Not Found")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(500, message)
    }

    /// Check if this is a success response (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}
