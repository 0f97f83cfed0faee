//! Request and response adaptation between axum and the handler contract
//!
//! Pure translation, no routing or business logic.

use std::borrow::Cow;
use std::collections::HashMap;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use percent_encoding::percent_decode_str;
use thiserror::Error;

use monoservice_sdk::{Request as SdkRequest, Response as SdkResponse};

#[derive(Error, Debug)]
pub enum AdaptError {
    #[error("failed to read request body: {0}")]
    Body(#[source] axum::Error),
}

/// Request path with percent-escapes decoded, the form routes are bound under.
///
/// Escapes that do not decode to UTF-8 are replaced, so such a path never
/// matches a route.
pub fn decoded_path(uri: &Uri) -> Cow<'_, str> {
    percent_decode_str(uri.path()).decode_utf8_lossy()
}

/// Build the contract's request from an inbound axum request.
///
/// Reads at most `max_body_bytes` of body.
pub async fn to_sdk_request(
    request: Request<Body>,
    max_body_bytes: usize,
    request_id: &str,
) -> Result<SdkRequest, AdaptError> {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(header::HOST)
        .map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned())
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(q) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(q.as_bytes()) {
            query.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    let body = axum::body::to_bytes(body, max_body_bytes)
        .await
        .map_err(AdaptError::Body)?;

    Ok(SdkRequest {
        method: parts.method.to_string(),
        host,
        path: decoded_path(&parts.uri).into_owned(),
        body: body.to_vec(),
        headers,
        query,
        request_id: request_id.to_string(),
    })
}

/// Write the contract's response as an HTTP response, always as JSON.
pub fn into_http_response(response: SdkResponse) -> Response {
    let status = StatusCode::from_u16(response.code).unwrap_or_else(|_| {
        tracing::warn!(code = response.code, "Handler returned an invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        response.json_content,
    )
        .into_response()
}

/// Host-generated `{"error": message}` response
pub fn error_response(status: StatusCode, message: &str) -> Response {
    into_http_response(SdkResponse::error(status.as_u16(), message))
}
