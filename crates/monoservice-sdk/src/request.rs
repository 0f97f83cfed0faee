//! Inbound request shape handed to `Handler::process`

use crate::error::HandlerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An inbound HTTP request, already detached from the transport.
///
/// Header names are stored lower-cased. Headers and query parameters keep
/// every value in arrival order, since both may legitimately repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method (GET, POST, ...)
    pub method: String,

    /// Value of the Host header, or the URI authority when absent
    pub host: String,

    /// Request path without the query string
    pub path: String,

    /// Raw request body
    #[serde(default)]
    pub body: Vec<u8>,

    /// Headers, lower-cased name -> values
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,

    /// Parsed query string, name -> values
    #[serde(default)]
    pub query: HashMap<String, Vec<String>>,

    /// Request ID assigned by the host for tracing
    #[serde(default)]
    pub request_id: String,
}

impl Request {
    /// First value of a header (case-insensitive lookup).
    ///
    /// # Example
    /// ```ignore
    /// let auth = req.header("Authorization");
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// First value of a query parameter.
    ///
    /// # Example
    /// ```ignore
    /// // URL: /search?q=rust
    /// let q = req.query_param("q"); // Some("rust")
    /// ```
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value given for a query parameter, empty if absent.
    pub fn query_values(&self, name: &str) -> &[String] {
        self.query.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str, HandlerError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| HandlerError::BadRequest(format!("Body is not valid UTF-8: {}", e)))
    }

    /// Parse the body as JSON into a typed struct.
    ///
    /// # Example
    /// ```ignore
    /// #[derive(Deserialize)]
    /// struct Greeting { name: String }
    ///
    /// let greeting: Greeting = req.json()?;
    /// ```
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HandlerError::BadRequest(format!("Invalid JSON: {}", e)))
    }

    /// Check if request method matches (case-insensitive).
    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }
}
